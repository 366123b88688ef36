//! JSON API handlers.

use std::collections::BTreeMap;

use {
    axum::{
        body::Bytes,
        extract::{Path, Query, State},
        response::{
            IntoResponse, Json, Response,
            sse::{KeepAlive, Sse},
        },
    },
    chrono::{DateTime, Utc},
    jobkit_cron::{
        InvocationRecord, JobSchedulerStatus, JobStats, ManagerStatus, OutputChunk, Parameters,
    },
    serde::{Deserialize, Serialize},
    tracing::info,
};

use crate::{
    error::{ApiError, ApiResult},
    server::AppState,
    stream,
};

#[derive(Debug, Default, Deserialize)]
pub struct AfterQuery {
    /// Only chunks written after this instant.
    pub after: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub status: JobSchedulerStatus,
    pub history: Vec<InvocationRecord>,
    pub stats: JobStats,
}

#[derive(Debug, Serialize)]
pub struct OutputResponse {
    pub server_time: DateTime<Utc>,
    pub chunks: Vec<OutputChunk>,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "title": state.title,
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at,
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "jobs": state.manager.jobs().len(),
    }))
}

pub async fn status(State(state): State<AppState>) -> Json<ManagerStatus> {
    Json(state.manager.status())
}

pub async fn jobs(State(state): State<AppState>) -> Json<Vec<JobSchedulerStatus>> {
    Json(state.manager.status().jobs)
}

pub async fn jobs_running(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, InvocationRecord>> {
    Json(state.manager.status().running)
}

pub async fn job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<JobDetail>> {
    let scheduler = state.manager.job(&name)?;
    Ok(Json(JobDetail {
        status: scheduler.status(),
        history: scheduler.history(),
        stats: scheduler.stats(),
    }))
}

pub async fn job_run(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Json<InvocationRecord>> {
    let parameters: Option<Parameters> = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(
            serde_json::from_slice(&body)
                .map_err(|e| ApiError::BadRequest(format!("invalid parameters: {e}")))?,
        )
    };
    let invocation = state.manager.run_job(&name, parameters.as_ref())?;
    info!(job = %name, invocation = %invocation.id(), "run requested");
    Ok(Json(invocation.record()))
}

pub async fn job_cancel(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<JobSchedulerStatus>> {
    let scheduler = state.manager.job(&name)?;
    scheduler.cancel().await?;
    info!(job = %name, "cancel requested");
    Ok(Json(scheduler.status()))
}

pub async fn job_disable(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<JobSchedulerStatus>> {
    state.manager.disable_jobs(&[&name]).await?;
    Ok(Json(state.manager.job(&name)?.status()))
}

pub async fn job_enable(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<JobSchedulerStatus>> {
    state.manager.enable_jobs(&[&name]).await?;
    Ok(Json(state.manager.job(&name)?.status()))
}

pub async fn pause(State(state): State<AppState>) -> ApiResult<Json<ManagerStatus>> {
    info!("pausing all jobs");
    state.manager.stop().await?;
    Ok(Json(state.manager.status()))
}

pub async fn resume(State(state): State<AppState>) -> Json<ManagerStatus> {
    info!("resuming all jobs");
    state.manager.start_async();
    Json(state.manager.status())
}

pub async fn invocation(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> ApiResult<Json<InvocationRecord>> {
    Ok(Json(state.manager.job(&name)?.invocation_record(&id)?))
}

pub async fn invocation_output(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Query(query): Query<AfterQuery>,
) -> ApiResult<Json<OutputResponse>> {
    let record = state.manager.job(&name)?.invocation_record(&id)?;
    Ok(Json(OutputResponse {
        server_time: Utc::now(),
        chunks: record.output.chunks(query.after),
    }))
}

pub async fn invocation_output_stream(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Query(query): Query<AfterQuery>,
) -> ApiResult<Response> {
    let scheduler = state.manager.job(&name)?;
    let response = match scheduler.live_invocation(&id).filter(|i| !i.is_done()) {
        Some(invocation) => Sse::new(stream::live(invocation, query.after))
            .keep_alive(KeepAlive::default())
            .into_response(),
        None => {
            let record = scheduler.invocation_record(&id)?;
            Sse::new(stream::finished(record, query.after)).into_response()
        },
    };
    Ok(response)
}
