//! Metric name and label definitions.
//!
//! Every metric jobkit records is named here so the full set can be read in
//! one place.

/// HTTP management API metrics
pub mod http {
    /// Total number of HTTP requests handled
    pub const REQUESTS_TOTAL: &str = "jobkit_http_requests_total";
    /// Duration of HTTP requests in seconds
    pub const REQUEST_DURATION_SECONDS: &str = "jobkit_http_request_duration_seconds";
    /// Number of output streams currently attached to a running invocation
    pub const OUTPUT_STREAMS_ACTIVE: &str = "jobkit_http_output_streams_active";
}

/// Scheduler and invocation metrics
pub mod jobs {
    /// Number of jobs loaded into the manager
    pub const LOADED: &str = "jobkit_jobs_loaded";
    /// Number of invocations currently running
    pub const RUNNING: &str = "jobkit_jobs_running";
    /// Total invocations started
    pub const INVOCATIONS_TOTAL: &str = "jobkit_job_invocations_total";
    /// Total invocations that finished, labelled by terminal status
    pub const COMPLETIONS_TOTAL: &str = "jobkit_job_completions_total";
    /// Invocation wall-clock duration in seconds
    pub const INVOCATION_DURATION_SECONDS: &str = "jobkit_job_invocation_duration_seconds";
    /// Broken/fixed transitions
    pub const TRANSITIONS_TOTAL: &str = "jobkit_job_transitions_total";
    /// Run requests rejected because the job was already running
    pub const ALREADY_RUNNING_TOTAL: &str = "jobkit_job_already_running_total";
    /// Delay between the planned fire time and the actual dispatch, in seconds
    pub const SCHEDULE_LATENCY_SECONDS: &str = "jobkit_job_schedule_latency_seconds";
}

/// History store metrics
pub mod history {
    /// Records appended to a history store
    pub const RECORDS_ADDED_TOTAL: &str = "jobkit_history_records_added_total";
    /// Records removed by culling
    pub const RECORDS_CULLED_TOTAL: &str = "jobkit_history_records_culled_total";
    /// Durable history failures (persist, restore, cull)
    pub const ERRORS_TOTAL: &str = "jobkit_history_errors_total";
}

/// Retry queue metrics
pub mod retry {
    /// Work items accepted by a queue
    pub const ITEMS_ADDED_TOTAL: &str = "jobkit_retry_items_added_total";
    /// Action attempts, labelled by outcome
    pub const ATTEMPTS_TOTAL: &str = "jobkit_retry_attempts_total";
    /// Items dropped after exhausting their attempts
    pub const ITEMS_DROPPED_TOTAL: &str = "jobkit_retry_items_dropped_total";
}

/// Notification delivery metrics
pub mod notify {
    /// Notifications enqueued, labelled by channel and flag
    pub const ENQUEUED_TOTAL: &str = "jobkit_notifications_enqueued_total";
    /// Notifications delivered, labelled by channel
    pub const DELIVERED_TOTAL: &str = "jobkit_notifications_delivered_total";
    /// Failed delivery attempts, labelled by channel
    pub const ERRORS_TOTAL: &str = "jobkit_notification_errors_total";
}

/// Common label keys
pub mod labels {
    pub const JOB: &str = "job";
    pub const STATUS: &str = "status";
    pub const FLAG: &str = "flag";
    pub const CHANNEL: &str = "channel";
    pub const OUTCOME: &str = "outcome";
    pub const ENDPOINT: &str = "endpoint";
    pub const METHOD: &str = "method";
    pub const BACKEND: &str = "backend";
}

/// Standard histogram buckets
pub mod buckets {
    use once_cell::sync::Lazy;

    /// HTTP request duration buckets (in seconds)
    /// Covers 1ms to 60s
    pub static HTTP_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ]
    });

    /// Invocation duration buckets (in seconds)
    /// Covers 10ms to 6 hours, since batch jobs run long
    pub static INVOCATION_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 10800.0,
            21600.0,
        ]
    });

    /// Scheduling latency buckets (in seconds)
    pub static SCHEDULE_LATENCY: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0,
        ]
    });
}
