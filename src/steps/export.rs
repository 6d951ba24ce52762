//! Export step: writes copies of the container and passes it through.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{require_input, StepContext, StepExecutor, StepKind};
use crate::data::DataContainer;
use crate::error::StepError;
use crate::store::encode_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Yaml,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Csv => "csv",
        }
    }
}

fn default_formats() -> Vec<ExportFormat> {
    vec![ExportFormat::Json]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_formats")]
    pub formats: Vec<ExportFormat>,

    /// Overrides the engine's export directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,

    /// File name without extension; defaults to `{run_id}_{step_id}`.
    /// Characters outside `[A-Za-z0-9_-]` are percent-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_stem: Option<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            formats: default_formats(),
            output_dir: None,
            file_stem: None,
        }
    }
}

pub struct ExportStep<'a> {
    config: &'a ExportConfig,
}

impl<'a> ExportStep<'a> {
    pub fn new(config: &'a ExportConfig) -> Self {
        Self { config }
    }

    /// Paths the step writes for the given context, one per format.
    pub fn targets(&self, ctx: &StepContext<'_>) -> Vec<(ExportFormat, PathBuf)> {
        let dir = self.config.output_dir.as_deref().unwrap_or(ctx.export_dir);
        let stem = match &self.config.file_stem {
            Some(stem) => encode_id(stem),
            None => format!("{}_{}", encode_id(ctx.run_id), encode_id(ctx.step_id)),
        };
        self.config
            .formats
            .iter()
            .map(|format| (*format, dir.join(format!("{}.{}", stem, format.extension()))))
            .collect()
    }
}

fn write_export(container: &DataContainer, format: ExportFormat, path: &Path) -> Result<(), String> {
    match format {
        ExportFormat::Json => {
            let json = serde_json::to_string_pretty(container).map_err(|e| e.to_string())?;
            fs::write(path, json).map_err(|e| e.to_string())
        }
        ExportFormat::Yaml => {
            let yaml = serde_yaml::to_string(container).map_err(|e| e.to_string())?;
            fs::write(path, yaml).map_err(|e| e.to_string())
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_path(path).map_err(|e| e.to_string())?;
            writer
                .write_record(["entity", "period", "type", "payload"])
                .map_err(|e| e.to_string())?;
            for (entity, period, cell) in container.slots() {
                let (type_name, payload) = match cell {
                    Some(payload) => (
                        payload.type_name().unwrap_or_default().to_string(),
                        payload.data().to_string(),
                    ),
                    None => (String::new(), String::new()),
                };
                writer
                    .write_record([entity, period, type_name.as_str(), payload.as_str()])
                    .map_err(|e| e.to_string())?;
            }
            writer.flush().map_err(|e| e.to_string())
        }
    }
}

impl StepExecutor for ExportStep<'_> {
    fn kind(&self) -> StepKind {
        StepKind::Export
    }

    fn validate_config(&self) -> Result<(), StepError> {
        if self.config.formats.is_empty() {
            return Err(StepError::validation("export step needs at least one format"));
        }
        Ok(())
    }

    fn execute(
        &self,
        ctx: &StepContext<'_>,
        input: Option<DataContainer>,
    ) -> Result<DataContainer, StepError> {
        self.validate_config()?;
        let mut container = require_input(StepKind::Export, input)?;

        let targets = self.targets(ctx);
        if let Some((_, first)) = targets.first() {
            if let Some(dir) = first.parent() {
                fs::create_dir_all(dir).map_err(|e| {
                    StepError::execution(format!("cannot create {}: {}", dir.display(), e))
                })?;
            }
        }

        let mut written = Vec::with_capacity(targets.len());
        for (format, path) in targets {
            write_export(&container, format, &path).map_err(|e| {
                StepError::execution(format!("export to {} failed: {}", path.display(), e))
            })?;
            info!("{}: exported {}", ctx.step_id, path.display());
            written.push(path.display().to_string());
        }

        container
            .metadata
            .insert("exported_files".to_string(), json!(written));
        Ok(container)
    }
}
