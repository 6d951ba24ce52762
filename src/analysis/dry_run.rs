//! Dry-run analysis runner: records what would be analyzed.

use log::info;
use parking_lot::Mutex;
use serde_json::json;

use super::{AnalysisOutcome, AnalysisRequest, AnalysisRunner};
use crate::data::Payload;
use crate::error::AnalysisError;

/// Runner that never calls out; every request succeeds with a
/// placeholder payload describing the request.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    requests: Mutex<Vec<AnalysisRequest>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<AnalysisRequest> {
        self.requests.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

impl AnalysisRunner for DryRunRunner {
    fn run(&self, request: &AnalysisRequest) -> Result<AnalysisOutcome, AnalysisError> {
        info!(
            "[DRY RUN] {} analysis: {} {}",
            request.config.kind.as_str(),
            request.entity,
            request.period.as_deref().unwrap_or("(all periods)")
        );

        let mut requests = self.requests.lock();
        requests.push(request.clone());
        let run_id = format!("dry-run-{}", requests.len());

        let payload = Payload::plain(json!({
            "dry_run": true,
            "entity": request.entity,
            "period": request.period,
            "kind": request.config.kind.as_str(),
        }));
        Ok(AnalysisOutcome::new(payload).with_run_id(run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisConfig;

    #[test]
    fn test_dry_run_records_requests() {
        let runner = DryRunRunner::new();
        assert!(runner.is_empty());

        let first = runner
            .run(&AnalysisRequest::new("AAPL", AnalysisConfig::default()).for_period("2024"))
            .unwrap();
        let second = runner
            .run(&AnalysisRequest::new("MSFT", AnalysisConfig::default()))
            .unwrap();

        assert_eq!(runner.len(), 2);
        assert_eq!(first.run_id.as_deref(), Some("dry-run-1"));
        assert_eq!(second.run_id.as_deref(), Some("dry-run-2"));
        assert_eq!(first.payload.field("entity"), Some(&json!("AAPL")));
        assert_eq!(runner.requests()[1].entity, "MSFT");
    }
}
