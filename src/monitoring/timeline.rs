//! Execution Timeline
//!
//! Tracks step start/end times of a workflow run for the timing report
//! logged when the run ends.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
    /// Run was cancelled during the step
    Cancelled,
}

impl EventType {
    fn is_end(&self) -> bool {
        !matches!(self, Self::Started)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Started => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step_id: String,
    pub event_type: EventType,
    /// Monotonic instant, for durations
    pub instant: Instant,
    /// Wall-clock time, for reports
    pub timestamp: DateTime<Utc>,
}

/// Timing of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTiming {
    /// Offset of the start from the beginning of the timeline
    pub offset: Duration,
    pub duration: Option<Duration>,
    pub outcome: EventType,
}

/// Tracks the execution timeline of a workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    run_id: String,
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step_id: &str, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id: step_id.to_string(),
            event_type,
            instant: Instant::now(),
            timestamp: Utc::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Per-step timing in the order steps started. A step that never ended
    /// has no duration and outcome `Started`.
    pub fn step_timings(&self) -> IndexMap<String, StepTiming> {
        let mut timings: IndexMap<String, (Instant, StepTiming)> = IndexMap::new();

        for event in &self.events {
            if event.event_type == EventType::Started {
                timings.insert(
                    event.step_id.clone(),
                    (
                        event.instant,
                        StepTiming {
                            offset: event.instant.duration_since(self.start_time),
                            duration: None,
                            outcome: EventType::Started,
                        },
                    ),
                );
            } else if let Some((started, timing)) = timings.get_mut(&event.step_id) {
                timing.duration = Some(event.instant.duration_since(*started));
                timing.outcome = event.event_type;
            }
        }

        timings
            .into_iter()
            .map(|(step_id, (_, timing))| (step_id, timing))
            .collect()
    }

    /// Durations of steps that ended, in milliseconds.
    pub fn durations(&self) -> IndexMap<String, u128> {
        self.step_timings()
            .into_iter()
            .filter_map(|(step_id, timing)| timing.duration.map(|d| (step_id, d.as_millis())))
            .collect()
    }

    /// Multi-line timing report.
    pub fn summary(&self) -> String {
        let mut output = format!("Run {} timeline:\n", self.run_id);
        for (step_id, timing) in self.step_timings() {
            let duration = timing
                .duration
                .map(|d| format!("{} ms", d.as_millis()))
                .unwrap_or_else(|| "-".to_string());
            output.push_str(&format!(
                "  {} +{} ms  {}  {}\n",
                truncate(&step_id, 20),
                timing.offset.as_millis(),
                duration,
                timing.outcome.label()
            ));
        }
        let ended = self.events.iter().filter(|e| e.event_type.is_end()).count();
        output.push_str(&format!(
            "  {} steps ended, total {} ms",
            ended,
            self.elapsed().as_millis()
        ));
        output
    }
}

/// Pads or truncates a string to exactly `width` characters.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        format!("{:width$}", s, width = width)
    } else {
        let head: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
