//! Metrics recorder initialization and configuration.

use {anyhow::Result, tracing::info};

/// Handle to the installed recorder, used to render the `/metrics` payload.
#[derive(Clone)]
pub struct MetricsHandle {
    #[cfg(feature = "prometheus")]
    prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

impl MetricsHandle {
    /// Render metrics in Prometheus text format.
    ///
    /// Empty when the `prometheus` feature is off.
    #[must_use]
    pub fn render(&self) -> String {
        #[cfg(feature = "prometheus")]
        {
            self.prometheus_handle.render()
        }
        #[cfg(not(feature = "prometheus"))]
        {
            String::new()
        }
    }
}

/// Configuration for the metrics system.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorderConfig {
    /// Whether metrics collection is enabled
    pub enabled: bool,
    /// Labels attached to every metric (e.g. `instance`)
    pub global_labels: Vec<(String, String)>,
}

/// Install the global metrics recorder.
///
/// Call once at startup. Without the `prometheus` feature every macro call is
/// a no-op and the returned handle renders nothing.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or installed.
pub fn init_metrics(config: MetricsRecorderConfig) -> Result<MetricsHandle> {
    if !config.enabled {
        info!("metrics collection is disabled");
        #[cfg(feature = "prometheus")]
        {
            let handle = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
            return Ok(MetricsHandle {
                prometheus_handle: handle.handle(),
            });
        }
        #[cfg(not(feature = "prometheus"))]
        return Ok(MetricsHandle {});
    }

    #[cfg(feature = "prometheus")]
    {
        let handle = init_prometheus(config)?;
        info!("prometheus metrics exporter initialized");
        Ok(MetricsHandle {
            prometheus_handle: handle,
        })
    }

    #[cfg(not(feature = "prometheus"))]
    {
        let _ = config;
        info!("metrics feature not enabled at compile time");
        Ok(MetricsHandle {})
    }
}

#[cfg(feature = "prometheus")]
fn init_prometheus(
    config: MetricsRecorderConfig,
) -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    use {
        crate::{buckets, jobs},
        metrics_exporter_prometheus::{Matcher, PrometheusBuilder},
    };

    let mut builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_request_duration_seconds".to_string()),
            &buckets::HTTP_DURATION,
        )?
        .set_buckets_for_metric(
            Matcher::Full(jobs::INVOCATION_DURATION_SECONDS.to_string()),
            &buckets::INVOCATION_DURATION,
        )?
        .set_buckets_for_metric(
            Matcher::Full(jobs::SCHEDULE_LATENCY_SECONDS.to_string()),
            &buckets::SCHEDULE_LATENCY,
        )?;

    for (key, value) in config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    // install_recorder() registers globally without spawning an HTTP listener;
    // the gateway serves the rendered text itself.
    let handle = builder.install_recorder()?;
    Ok(handle)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_recorder_renders_nothing() {
        let handle = init_metrics(MetricsRecorderConfig {
            enabled: false,
            global_labels: vec![("service".into(), "jobkit".into())],
        })
        .unwrap();
        assert!(handle.render().trim().is_empty());
    }
}
