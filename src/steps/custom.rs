//! Custom analysis: one free-form prompt over the whole container.

use std::fmt::Write as _;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{require_input, StepContext, StepExecutor, StepKind};
use crate::analysis::{AnalysisConfig, AnalysisKind, AnalysisRequest};
use crate::data::{DataContainer, Payload, Shape};
use crate::error::StepError;

/// Entity key of the custom analysis result.
pub const CUSTOM_ENTITY: &str = "custom";

/// Period key of the custom analysis result.
pub const CUSTOM_PERIOD: &str = "result";

const DATA_PLACEHOLDER: &str = "{data}";

/// How the runner's response is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomConfig {
    /// Prompt with a `{data}` placeholder; `{entity_count}` and
    /// `{item_count}` are also substituted.
    pub prompt_template: String,

    #[serde(default)]
    pub output_format: OutputFormat,
}

pub struct CustomStep<'a> {
    config: &'a CustomConfig,
}

impl<'a> CustomStep<'a> {
    pub fn new(config: &'a CustomConfig) -> Self {
        Self { config }
    }

    fn render_prompt(&self, input: &DataContainer) -> String {
        self.config
            .prompt_template
            .replace("{entity_count}", &input.num_entities().to_string())
            .replace("{item_count}", &input.total_items().to_string())
            .replace(DATA_PLACEHOLDER, &render_container(input))
    }
}

/// Renders a container as indented text, one entity block per entity.
pub fn render_container(container: &DataContainer) -> String {
    let mut text = String::new();
    for entity in container.entities() {
        let _ = writeln!(text, "## {}", entity);
        for (period, cell) in container.entity(entity).into_iter().flatten() {
            match cell {
                Some(payload) => {
                    let _ = writeln!(text, "### {}", period);
                    let body = serde_json::to_string_pretty(payload.data())
                        .unwrap_or_else(|_| payload.data().to_string());
                    let _ = writeln!(text, "{}", body);
                }
                None => {
                    let _ = writeln!(text, "### {} (no data)", period);
                }
            }
        }
        text.push('\n');
    }
    text
}

/// Interprets a model response as JSON.
///
/// Tries the whole response first, then the first fenced ```json block.
/// Returns `None` when neither parses.
pub fn parse_structured(response: &str) -> Option<Value> {
    let trimmed = response.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let start = trimmed.find("```json")? + "```json".len();
    let rest = &trimmed[start..];
    let end = rest.find("```")?;
    serde_json::from_str(rest[..end].trim()).ok()
}

impl StepExecutor for CustomStep<'_> {
    fn kind(&self) -> StepKind {
        StepKind::CustomAnalysis
    }

    fn validate_config(&self) -> Result<(), StepError> {
        if !self.config.prompt_template.contains(DATA_PLACEHOLDER) {
            return Err(StepError::validation(
                "prompt_template must contain a {data} placeholder",
            ));
        }
        Ok(())
    }

    fn execute(
        &self,
        ctx: &StepContext<'_>,
        input: Option<DataContainer>,
    ) -> Result<DataContainer, StepError> {
        self.validate_config()?;
        let input = require_input(StepKind::CustomAnalysis, input)?;
        ctx.checkpoint()?;

        let prompt = self.render_prompt(&input);
        info!(
            "{}: custom analysis over {} items ({} prompt bytes)",
            ctx.step_id,
            input.total_items(),
            prompt.len()
        );

        let request = AnalysisRequest::new(
            CUSTOM_ENTITY,
            AnalysisConfig::new(AnalysisKind::Custom).with_prompt(prompt),
        );
        let outcome = ctx
            .runner
            .run(&request)
            .map_err(|e| StepError::execution(format!("custom analysis failed: {}", e)))?;

        let mut output = input.derive(ctx.step_id, StepKind::CustomAnalysis);
        if let Some(run_id) = outcome.run_id {
            output.add_source_run(run_id);
        }

        let payload = match (self.config.output_format, outcome.payload) {
            (OutputFormat::Json, Payload::Plain(Value::String(text))) => {
                match parse_structured(&text) {
                    Some(value) => Payload::plain(value),
                    None => {
                        warn!("{}: response was not JSON, keeping it as text", ctx.step_id);
                        output.add_warning("custom analysis response was not valid JSON", Map::new());
                        Payload::plain(json!({ "text": text }))
                    }
                }
            }
            (OutputFormat::Text, Payload::Plain(Value::String(text))) => {
                Payload::plain(json!({ "text": text }))
            }
            (_, payload) => payload,
        };

        output.insert(CUSTOM_ENTITY, CUSTOM_PERIOD, Some(payload));
        Ok(output)
    }

    fn expected_output_shape(&self, _input: Shape) -> Shape {
        Shape::new(1, 1)
    }
}
