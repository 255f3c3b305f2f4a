use crate::engine::ProbeObserver;
use crate::model::{ProbeEvent, ProbeResult, RunOutcome, RunReport, Target};
use async_trait::async_trait;

/// Collects run events into an ordered report.
#[derive(Debug, Default, Clone)]
pub struct ResultAggregator {
    results: Vec<ProbeResult>,
    errors: Vec<String>,
    last_progress: Option<u8>,
    outcome: Option<RunOutcome>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event taken off the engine's channel.
    pub fn apply(&mut self, event: ProbeEvent) {
        match event {
            ProbeEvent::Result { result } => self.results.push(result),
            ProbeEvent::Progress { percent } => self.last_progress = Some(percent),
            ProbeEvent::Error { message, .. } => self.errors.push(message),
            ProbeEvent::Done { outcome } => self.outcome = Some(outcome),
        }
    }

    pub fn results(&self) -> &[ProbeResult] {
        &self.results
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn last_progress(&self) -> Option<u8> {
        self.last_progress
    }

    /// `None` until the run has finished.
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn into_report(self, run_id: String, total_targets: usize) -> RunReport {
        RunReport {
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            timestamp_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            run_id,
            total_targets,
            outcome: self.outcome,
            results: self.results,
            errors: self.errors,
        }
    }
}

#[async_trait]
impl ProbeObserver for ResultAggregator {
    async fn on_result(&mut self, result: &ProbeResult) {
        self.results.push(result.clone());
    }

    async fn on_progress(&mut self, percent: u8) {
        self.last_progress = Some(percent);
    }

    async fn on_error(&mut self, _target: &Target, message: &str) {
        self.errors.push(message.to_string());
    }

    async fn on_done(&mut self, outcome: RunOutcome) {
        self.outcome = Some(outcome);
    }
}
