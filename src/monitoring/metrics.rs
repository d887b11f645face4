//! Metrics Port
//!
//! The engine reports measurements through an injected [`MetricsSink`]
//! owned by the host process. Transitions produce [`Measurement`] values,
//! which are only emitted once the transition has been committed.

use std::time::Duration;

use log::info;

use crate::workflow::RunOutcome;

/// Observability sink with one method per measurement.
pub trait MetricsSink: Send + Sync {
    /// Time between run creation and the start of execution.
    fn execution_latency(&self, latency: Duration);

    /// Wall-clock time from start to finalization.
    fn execution_duration(&self, duration: Duration, outcome: RunOutcome);

    /// A run reached its final state.
    fn execution_completed(&self, outcome: RunOutcome);

    /// A step request expired before the executor answered.
    fn step_timed_out(&self);

    /// Number of steps a finished run executed.
    fn steps_executed(&self, count: usize);

    /// How long a step stayed suspended before being resumed.
    fn suspend_duration(&self, duration: Duration);
}

/// A single measurement, in value form.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    ExecutionLatency(Duration),
    ExecutionDuration {
        duration: Duration,
        outcome: RunOutcome,
    },
    ExecutionCompleted(RunOutcome),
    StepTimedOut,
    StepsExecuted(usize),
    SuspendDuration(Duration),
}

impl Measurement {
    /// Forwards this measurement to the matching sink method.
    pub fn emit(&self, sink: &dyn MetricsSink) {
        match self {
            Self::ExecutionLatency(latency) => sink.execution_latency(*latency),
            Self::ExecutionDuration { duration, outcome } => {
                sink.execution_duration(*duration, *outcome)
            }
            Self::ExecutionCompleted(outcome) => sink.execution_completed(*outcome),
            Self::StepTimedOut => sink.step_timed_out(),
            Self::StepsExecuted(count) => sink.steps_executed(*count),
            Self::SuspendDuration(duration) => sink.suspend_duration(*duration),
        }
    }
}

/// Converts a chrono span into a std duration, clamping negatives to zero.
pub fn to_duration(span: chrono::Duration) -> Duration {
    span.to_std().unwrap_or(Duration::ZERO)
}

/// Sink that writes every measurement to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn execution_latency(&self, latency: Duration) {
        info!("metric execution_latency_ms={}", latency.as_millis());
    }

    fn execution_duration(&self, duration: Duration, outcome: RunOutcome) {
        info!(
            "metric execution_duration_ms={} outcome={}",
            duration.as_millis(),
            outcome
        );
    }

    fn execution_completed(&self, outcome: RunOutcome) {
        info!("metric executions_completed=1 outcome={}", outcome);
    }

    fn step_timed_out(&self) {
        info!("metric step_timeouts=1");
    }

    fn steps_executed(&self, count: usize) {
        info!("metric steps_executed={}", count);
    }

    fn suspend_duration(&self, duration: Duration) {
        info!("metric suspend_duration_ms={}", duration.as_millis());
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn execution_latency(&self, _latency: Duration) {}
    fn execution_duration(&self, _duration: Duration, _outcome: RunOutcome) {}
    fn execution_completed(&self, _outcome: RunOutcome) {}
    fn step_timed_out(&self) {}
    fn steps_executed(&self, _count: usize) {}
    fn suspend_duration(&self, _duration: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::RecordingMetrics;

    #[test]
    fn test_emit_routes_to_matching_method() {
        let sink = RecordingMetrics::new();

        Measurement::StepTimedOut.emit(&sink);
        Measurement::StepsExecuted(3).emit(&sink);
        Measurement::ExecutionCompleted(RunOutcome::Cancelled).emit(&sink);

        assert_eq!(
            sink.measurements(),
            vec![
                Measurement::StepTimedOut,
                Measurement::StepsExecuted(3),
                Measurement::ExecutionCompleted(RunOutcome::Cancelled),
            ]
        );
    }

    #[test]
    fn test_to_duration_clamps_negative() {
        assert_eq!(to_duration(chrono::Duration::seconds(-5)), Duration::ZERO);
        assert_eq!(
            to_duration(chrono::Duration::milliseconds(1500)),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_log_and_noop_sinks_accept_everything() {
        for sink in [&LogMetrics as &dyn MetricsSink, &NoopMetrics] {
            Measurement::ExecutionLatency(Duration::from_millis(5)).emit(sink);
            Measurement::SuspendDuration(Duration::from_secs(1)).emit(sink);
        }
    }
}
