//! Monitoring Module
//!
//! Observability port for the engine.
//!
//! # Components
//!
//! - [`MetricsSink`]: One method per measurement, injected by the host
//! - [`RecordingMetrics`]: In-memory sink with a printable summary

pub mod metrics;
pub mod recorder;

pub use metrics::{LogMetrics, Measurement, MetricsSink, NoopMetrics};
pub use recorder::RecordingMetrics;
