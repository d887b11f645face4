//! Recorded Measurements
//!
//! Keeps every measurement in memory for inspection and for the summary
//! printed at the end of a CLI run.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::metrics::{Measurement, MetricsSink};
use crate::workflow::RunOutcome;

/// Metrics sink that stores measurements in arrival order.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    measurements: Mutex<Vec<Measurement>>,
}

impl RecordingMetrics {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<Measurement>> {
        self.measurements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, measurement: Measurement) {
        self.guard().push(measurement);
    }

    /// Returns a snapshot of all recorded measurements.
    pub fn measurements(&self) -> Vec<Measurement> {
        self.guard().clone()
    }

    /// Counts recorded measurements matching a predicate.
    pub fn count(&self, predicate: impl Fn(&Measurement) -> bool) -> usize {
        self.measurements().iter().filter(|m| predicate(m)).count()
    }

    /// Generates a short human-readable summary.
    pub fn summary(&self) -> String {
        let measurements = self.measurements();
        let mut output = String::from("Execution Summary:\n");

        let mut completed = 0;
        let mut steps = 0;
        let mut timeouts = 0;
        let mut total_duration = Duration::ZERO;

        for measurement in &measurements {
            match measurement {
                Measurement::ExecutionCompleted(_) => completed += 1,
                Measurement::StepsExecuted(count) => steps += count,
                Measurement::StepTimedOut => timeouts += 1,
                Measurement::ExecutionDuration { duration, .. } => total_duration += *duration,
                _ => {}
            }
        }

        output.push_str(&format!("  Runs completed:  {}\n", completed));
        output.push_str(&format!("  Steps executed:  {}\n", steps));
        output.push_str(&format!("  Step timeouts:   {}\n", timeouts));
        output.push_str(&format!("  Total duration:  {:.2?}\n", total_duration));
        output
    }
}

impl MetricsSink for RecordingMetrics {
    fn execution_latency(&self, latency: Duration) {
        self.record(Measurement::ExecutionLatency(latency));
    }

    fn execution_duration(&self, duration: Duration, outcome: RunOutcome) {
        self.record(Measurement::ExecutionDuration { duration, outcome });
    }

    fn execution_completed(&self, outcome: RunOutcome) {
        self.record(Measurement::ExecutionCompleted(outcome));
    }

    fn step_timed_out(&self) {
        self.record(Measurement::StepTimedOut);
    }

    fn steps_executed(&self, count: usize) {
        self.record(Measurement::StepsExecuted(count));
    }

    fn suspend_duration(&self, duration: Duration) {
        self.record(Measurement::SuspendDuration(duration));
    }
}
