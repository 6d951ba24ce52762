//! Analysis Runner Contract
//!
//! The analysis runner performs the actual per-entity work (model calls,
//! document processing) and is implemented outside this crate. Step
//! executors and the batch queue both call it through [`AnalysisRunner`],
//! possibly from several threads at once.
//!
//! Two runners ship with the crate:
//!
//! - [`CommandRunner`]: delegates each request to an external command
//! - [`DryRunRunner`]: records requests without doing any work

pub mod command;
pub mod dry_run;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::Payload;

pub use crate::error::AnalysisError;
pub use command::CommandRunner;
pub use dry_run::DryRunRunner;

/// Filing type used when none is configured.
pub const DEFAULT_FILING_TYPE: &str = "10-K";

/// Number of periods analyzed when no horizon is configured.
pub const DEFAULT_HORIZON: u32 = 5;

/// What kind of analysis a request asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    #[default]
    Fundamental,
    Perspective,
    SuccessFactors,
    Custom,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fundamental => "fundamental",
            Self::Perspective => "perspective",
            Self::SuccessFactors => "success_factors",
            Self::Custom => "custom",
        }
    }
}

/// Parameters of an analysis invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub kind: AnalysisKind,

    /// Filing or period kind to analyze (e.g. "10-K", "10-Q")
    #[serde(default = "default_filing_type")]
    pub filing_type: String,

    /// Number of periods to look back
    #[serde(default = "default_horizon")]
    pub horizon: u32,

    /// Analyst perspective for perspective analyses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perspective: Option<String>,

    /// Fully rendered prompt for custom analyses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

fn default_filing_type() -> String {
    DEFAULT_FILING_TYPE.to_string()
}

fn default_horizon() -> u32 {
    DEFAULT_HORIZON
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            kind: AnalysisKind::default(),
            filing_type: default_filing_type(),
            horizon: DEFAULT_HORIZON,
            perspective: None,
            prompt: None,
        }
    }
}

impl AnalysisConfig {
    pub fn new(kind: AnalysisKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_filing_type(mut self, filing_type: impl Into<String>) -> Self {
        self.filing_type = filing_type.into();
        self
    }

    pub fn with_horizon(mut self, horizon: u32) -> Self {
        self.horizon = horizon;
        self
    }

    pub fn with_perspective(mut self, perspective: impl Into<String>) -> Self {
        self.perspective = Some(perspective.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// A single unit of analysis work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Entity key (e.g. a ticker)
    pub entity: String,

    /// Period key; `None` asks for the whole configured horizon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,

    pub config: AnalysisConfig,

    /// Prior results the analysis should build on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl AnalysisRequest {
    pub fn new(entity: impl Into<String>, config: AnalysisConfig) -> Self {
        Self {
            entity: entity.into(),
            period: None,
            config,
            context: None,
        }
    }

    pub fn for_period(mut self, period: impl Into<String>) -> Self {
        self.period = Some(period.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Result of a successful analysis invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    /// Identifier of the analysis run that produced the result, if any
    pub run_id: Option<String>,
    pub payload: Payload,
}

impl AnalysisOutcome {
    pub fn new(payload: Payload) -> Self {
        Self {
            run_id: None,
            payload,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Performs analysis work for one entity (and optionally one period).
///
/// Implementations must be safe to call concurrently: analysis steps
/// fan requests out to a bounded pool of threads.
pub trait AnalysisRunner: Send + Sync {
    fn run(&self, request: &AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError>;
}
