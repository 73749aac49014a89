use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::pipeline::{Outcome, StageStatus};

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub targets_done: u64,
    pub targets_skipped: u64,
    pub targets_failed: u64,
    pub sessions_skipped: u64,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct StageMetrics {
    pub calls: u64,
    pub ran: u64,
    pub cached: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Advisory in-process counters for one run. Cloning shares the counters.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_stage_status(&self, stage_name: &str, status: StageStatus) {
        if let Ok(mut guard) = self.inner.lock() {
            let metrics = guard.stages.entry(stage_name.to_string()).or_default();
            match status {
                StageStatus::Ran => metrics.ran += 1,
                StageStatus::Cached => metrics.cached += 1,
            }
        }
    }

    pub fn record_target(&self, outcome: Outcome) {
        if let Ok(mut guard) = self.inner.lock() {
            match outcome {
                Outcome::Success => guard.targets_done += 1,
                Outcome::Skipped => guard.targets_skipped += 1,
                Outcome::Failed => guard.targets_failed += 1,
            }
        }
    }

    pub fn record_session_skipped(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.sessions_skipped += 1;
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(stage = self.stage.as_str(), duration_ms, "Stage duration recorded");
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        targets_done = snapshot.targets_done,
        targets_skipped = snapshot.targets_skipped,
        targets_failed = snapshot.targets_failed,
        sessions_skipped = snapshot.sessions_skipped,
        "Run metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            ran = metrics.ran,
            cached = metrics.cached,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}
