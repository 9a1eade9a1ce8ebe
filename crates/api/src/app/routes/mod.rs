use axum::{
    routing::{get, post},
    Router,
};

pub mod jobs;
pub mod stream;
pub mod system;

/// Router for the `/jobs` tree.
pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/stats", get(jobs::job_stats))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/updates", get(jobs::list_updates).post(jobs::post_update))
        .route("/jobs/:id/progress", post(jobs::post_progress))
        .route("/jobs/:id/heartbeat", post(jobs::post_heartbeat))
        .route("/jobs/:id/final", post(jobs::post_final))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/jobs/:id/liveness", get(jobs::get_liveness))
        .route("/jobs/:id/stream", get(stream::stream_job))
}
