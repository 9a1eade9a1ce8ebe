use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::warn;

use hopline_core::{FinalStatus, Heartbeat, Job, JobId, ProgressUpdate, Route, UpdateRequest};
use hopline_infra::ApplyOutcome;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// POST /jobs
pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let id = match body.id.as_deref() {
        Some(raw) => match dto::parse_job_id(raw) {
            Ok(id) => id,
            Err(resp) => return resp,
        },
        None => JobId::new(),
    };

    let mut route = Route::new(body.steps);
    if let Some(metadata) = body.metadata {
        route = route.with_metadata(metadata);
    }
    if let Err(e) = route.validate() {
        return errors::bad_request(e.to_string());
    }

    let mut job = Job::new(id, route, body.payload);
    if let Some(ms) = body.timeout_ms {
        job = job.with_timeout(Duration::from_millis(ms));
    }
    if body.start {
        job = job.started();
    }

    let job = match services.lifecycle().create(job).await {
        Ok(job) => job,
        Err(e) => return errors::store_error_to_response(e),
    };

    // The job stays recorded when the publish fails.
    let enqueued = match services.enqueue_first_hop(&job).await {
        Ok(queue) => queue,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "first hop not enqueued");
            return errors::enqueue_error_to_response(e);
        }
    };

    (StatusCode::CREATED, Json(dto::CreateJobResponse { job, enqueued })).into_response()
}

/// GET /jobs?status=&limit=
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let status = match query.status_filter() {
        Ok(status) => status,
        Err(resp) => return resp,
    };
    match services.lifecycle().list(status, query.effective_limit()).await {
        Ok(jobs) => Json(dto::JobListResponse {
            count: jobs.len(),
            jobs,
        })
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /jobs/stats
pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.lifecycle().stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.lifecycle().require(&job_id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /jobs/:id/updates
pub async fn list_updates(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.lifecycle().updates(&job_id).await {
        Ok(updates) => Json(updates).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /jobs/:id/updates
///
/// Terminal statuses go through `/final`.
pub async fn post_update(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateRequest>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if request.status.is_some_and(|s| s.is_terminal()) {
        return errors::json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "terminal_via_final",
            "terminal statuses must be posted to /jobs/:id/final",
        );
    }
    update_response(services.lifecycle().apply_update(&job_id, request).await)
}

/// POST /jobs/:id/progress
pub async fn post_progress(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(progress): Json<ProgressUpdate>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    update_response(services.lifecycle().apply_progress(&job_id, progress).await)
}

/// POST /jobs/:id/heartbeat
pub async fn post_heartbeat(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(heartbeat): Json<Heartbeat>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    update_response(services.lifecycle().ingest_heartbeat(&job_id, &heartbeat).await)
}

/// POST /jobs/:id/final
pub async fn post_final(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(status): Json<FinalStatus>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.lifecycle().finalize(&job_id, status).await {
        Ok(outcome) => Json(dto::FinalizeResponse { outcome }).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /jobs/:id/cancel
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.lifecycle().request_cancel(&job_id).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /jobs/:id/liveness
pub async fn get_liveness(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.lifecycle().liveness(&job_id).await {
        Ok(liveness) => Json(dto::LivenessResponse { job_id, liveness }).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

fn update_response(result: Result<ApplyOutcome, hopline_infra::JobStoreError>) -> axum::response::Response {
    match result {
        Ok(ApplyOutcome::Applied { job, update }) => Json(dto::UpdateResponse {
            applied: true,
            job,
            update: Some(update),
        })
        .into_response(),
        Ok(ApplyOutcome::AlreadyTerminal { job }) => Json(dto::UpdateResponse {
            applied: false,
            job,
            update: None,
        })
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
