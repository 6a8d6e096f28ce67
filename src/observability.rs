use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub steps: BTreeMap<String, StepMetrics>,
    pub total_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StepMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Wall-clock timings of the external steps a command runs.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_step(&self, step: impl Into<String>) -> StepTimer {
        StepTimer {
            step: step.into(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            failed: false,
            recorded: false,
        }
    }

    /// Time `f` as `step`, counting an `Err` as a failure.
    pub fn time<T, E>(&self, step: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let mut timer = self.start_step(step);
        let result = f();
        if result.is_err() {
            timer.mark_failed();
        }
        result
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

pub struct StepTimer {
    step: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    failed: bool,
    recorded: bool,
}

impl StepTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.steps.entry(self.step.clone()).or_default();
            metrics.calls += 1;
            if self.failed {
                metrics.failures += 1;
            }
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            step = self.step.as_str(),
            duration_ms,
            failed = self.failed,
            "Step duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        step_count = snapshot.steps.len(),
        "Run metrics summary"
    );
    for (step, metrics) in &snapshot.steps {
        info!(
            step = step.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Step metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP foundry_step_calls_total Step invocation count\n");
        output.push_str("# TYPE foundry_step_calls_total counter\n");
        output.push_str("# HELP foundry_step_failures_total Failed step invocations\n");
        output.push_str("# TYPE foundry_step_failures_total counter\n");
        output.push_str(
            "# HELP foundry_step_duration_seconds_total Accumulated step duration in seconds\n",
        );
        output.push_str("# TYPE foundry_step_duration_seconds_total counter\n");
        output.push_str("# HELP foundry_step_duration_seconds_max Maximum step duration in seconds\n");
        output.push_str("# TYPE foundry_step_duration_seconds_max gauge\n");
        for (step, metrics) in &self.steps {
            output.push_str(&format!(
                "foundry_step_calls_total{{step=\"{}\"}} {}\n",
                step, metrics.calls
            ));
            output.push_str(&format!(
                "foundry_step_failures_total{{step=\"{}\"}} {}\n",
                step, metrics.failures
            ));
            output.push_str(&format!(
                "foundry_step_duration_seconds_total{{step=\"{}\"}} {:.6}\n",
                step,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "foundry_step_duration_seconds_max{{step=\"{}\"}} {:.6}\n",
                step,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP foundry_run_duration_seconds Total command duration\n");
        output.push_str("# TYPE foundry_run_duration_seconds gauge\n");
        output.push_str(&format!(
            "foundry_run_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}
