//! External Command Runner
//!
//! Runs each analysis request through a shell command:
//! - The request is written to the command's stdin as JSON
//! - `ANALYSIS_ENTITY`, `ANALYSIS_PERIOD` and `ANALYSIS_KIND` are exported
//! - Stdout is parsed as the result (JSON, or free text)
//!
//! # Exit Codes
//!
//! - `0` - success
//! - `2` - fatal failure, never retried
//! - `3` - nothing to analyze for this entity (item is skipped)
//! - anything else - transient failure, may be retried

use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::thread;

use log::{debug, error, warn};
use serde_json::Value;

use super::{AnalysisOutcome, AnalysisRequest, AnalysisRunner};
use crate::data::Payload;
use crate::error::AnalysisError;

/// Exit code signalling a permanent failure.
pub const EXIT_FATAL: i32 = 2;

/// Exit code signalling that the entity has nothing to analyze.
pub const EXIT_NOT_APPLICABLE: i32 = 3;

/// Analysis runner backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    command: String,
    working_dir: Option<PathBuf>,
}

impl CommandRunner {
    /// Creates a runner that executes `command` with `bash -c`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
        }
    }

    /// Sets the working directory for the command.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn spawn(&self, request: &AnalysisRequest) -> Result<Output, AnalysisError> {
        let input = serde_json::to_vec(request)
            .map_err(|e| AnalysisError::Fatal(format!("failed to encode request: {}", e)))?;

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&self.command)
            .env("ANALYSIS_ENTITY", &request.entity)
            .env("ANALYSIS_PERIOD", request.period.as_deref().unwrap_or(""))
            .env("ANALYSIS_KIND", request.config.kind.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
            debug!("Executing analysis command in directory: {}", dir.display());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AnalysisError::Failed(format!("failed to start analysis command: {}", e)))?;

        // Stdout is drained while the request is still being written.
        let writer = child.stdin.take().map(|mut stdin| {
            thread::spawn(move || match stdin.write_all(&input) {
                // Commands that ignore stdin may exit before reading it.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            })
        });

        let output = child
            .wait_with_output()
            .map_err(|e| AnalysisError::Failed(format!("analysis command did not finish: {}", e)))?;

        if let Some(writer) = writer {
            match writer.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(AnalysisError::Failed(format!(
                        "failed to send request to analysis command: {}",
                        e
                    )))
                }
                Err(_) => {
                    return Err(AnalysisError::Failed(
                        "request writer for analysis command panicked".to_string(),
                    ))
                }
            }
        }

        Ok(output)
    }
}

impl AnalysisRunner for CommandRunner {
    fn run(&self, request: &AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError> {
        let label = match &request.period {
            Some(period) => format!("{}/{}", request.entity, period),
            None => request.entity.clone(),
        };

        let output = self.spawn(request)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            debug!("Analysis command for '{}' completed", label);
            return Ok(parse_output(&stdout));
        }

        let code = output.status.code();
        let detail = if stderr.trim().is_empty() {
            format!("analysis command for '{}' exited with {:?}", label, code)
        } else {
            stderr.trim().to_string()
        };

        match code {
            Some(EXIT_NOT_APPLICABLE) => {
                debug!("Analysis command reports nothing to analyze for '{}'", label);
                Err(AnalysisError::NotApplicable(detail))
            }
            Some(EXIT_FATAL) => {
                error!("Analysis command failed permanently for '{}': {}", label, detail);
                Err(AnalysisError::Fatal(detail))
            }
            _ => {
                warn!("Analysis command failed for '{}': {}", label, detail);
                Err(AnalysisError::Failed(detail))
            }
        }
    }
}

/// Parses command stdout into an outcome.
///
/// A JSON object with `payload` (and optionally `run_id`) is unpacked;
/// any other JSON becomes the payload; non-JSON output is kept as text.
fn parse_output(stdout: &str) -> AnalysisOutcome {
    let text = stdout.trim();
    if text.is_empty() {
        return AnalysisOutcome::new(Payload::plain(Value::Null));
    }

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(mut map)) if map.contains_key("payload") => {
            let run_id = match map.remove("run_id") {
                Some(Value::String(id)) => Some(id),
                _ => None,
            };
            let payload = Payload::from_value(map.remove("payload").unwrap_or(Value::Null));
            AnalysisOutcome { run_id, payload }
        }
        Ok(value) => AnalysisOutcome::new(Payload::from_value(value)),
        Err(_) => AnalysisOutcome::new(Payload::plain(Value::String(text.to_string()))),
    }
}
