use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        routing::{get, post},
    },
    chrono::{DateTime, Utc},
    jobkit_cron::JobManager,
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::info,
};

#[cfg(feature = "metrics")]
use jobkit_metrics::MetricsHandle;

use crate::routes;

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub title: String,
    pub started_at: DateTime<Utc>,
    #[cfg(feature = "metrics")]
    pub metrics_handle: Option<MetricsHandle>,
}

impl AppState {
    pub fn new(manager: Arc<JobManager>, title: impl Into<String>) -> Self {
        Self {
            manager,
            title: title.into(),
            started_at: Utc::now(),
            #[cfg(feature = "metrics")]
            metrics_handle: None,
        }
    }

    #[cfg(feature = "metrics")]
    #[must_use]
    pub fn with_metrics_handle(mut self, handle: MetricsHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the management router (shared between production startup and tests).
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/health", get(routes::health))
        .route("/status.json", get(routes::status))
        .route("/api/jobs", get(routes::jobs))
        .route("/api/jobs.running", get(routes::jobs_running))
        .route("/api/job/{name}", get(routes::job))
        .route("/api/job.run/{name}", post(routes::job_run))
        .route("/api/job.cancel/{name}", post(routes::job_cancel))
        .route("/api/job.disable/{name}", post(routes::job_disable))
        .route("/api/job.enable/{name}", post(routes::job_enable))
        .route("/api/pause", post(routes::pause))
        .route("/api/resume", post(routes::resume))
        .route("/api/job.invocation/{name}/{id}", get(routes::invocation))
        .route(
            "/api/job.invocation.output/{name}/{id}",
            get(routes::invocation_output),
        )
        .route(
            "/api/job.invocation.output.stream/{name}/{id}",
            get(routes::invocation_output_stream),
        );

    #[cfg(feature = "prometheus")]
    let router = router.route(
        "/metrics",
        get(crate::metrics_routes::prometheus_metrics_handler),
    );

    #[cfg(feature = "metrics")]
    let router = router.layer(axum::middleware::from_fn(
        crate::metrics_middleware::http_metrics_middleware,
    ));

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = build_app(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Bind `bind` and serve until `shutdown` is cancelled.
pub async fn start_server(
    bind: &str,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    info!(%addr, title = %state.title, "management server listening");
    serve(listener, state, shutdown).await
}
