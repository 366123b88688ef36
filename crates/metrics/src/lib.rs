//! Metrics collection and export for jobkit.
//!
//! All crates record through the `metrics` facade re-exported here. With the
//! `prometheus` feature the gateway can expose the recorded values at
//! `/metrics`; without it every macro is a no-op.
//!
//! ```rust,ignore
//! use jobkit_metrics::{counter, jobs, labels};
//!
//! counter!(jobs::INVOCATIONS_TOTAL, labels::JOB => "backup").increment(1);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

pub use metrics::{counter, gauge, histogram};
