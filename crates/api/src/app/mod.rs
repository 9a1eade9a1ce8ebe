//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: job lifecycle, store and transport wiring
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs and mapping helpers
//! - `errors.rs`: consistent `{error, message}` responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(Extension(services))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn app() -> Router {
        build_app(Arc::new(AppServices::in_memory()))
    }

    #[tokio::test]
    async fn create_then_read_back() {
        let app = app();
        let (status, created) = call(
            &app,
            "POST",
            "/jobs",
            Some(json!({"id": "j1", "steps": ["parse", "infer"], "payload": {"x": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["job"]["status"], "pending");
        assert!(created.get("enqueued").is_none());

        let (status, job) = call(&app, "GET", "/jobs/j1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["route"]["steps"], json!(["parse", "infer"]));
        assert_eq!(job["route"]["metadata"]["job_id"], "j1");
    }

    #[tokio::test]
    async fn errors_use_the_json_shape() {
        let app = app();
        let (status, body) = call(&app, "GET", "/jobs/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, body) = call(&app, "POST", "/jobs", Some(json!({"steps": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_error");

        call(&app, "POST", "/jobs", Some(json!({"id": "dup", "steps": ["a"]}))).await;
        let (status, body) = call(&app, "POST", "/jobs", Some(json!({"id": "dup", "steps": ["a"]}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");
    }

    #[tokio::test]
    async fn terminal_statuses_only_through_final() {
        let app = app();
        call(&app, "POST", "/jobs", Some(json!({"id": "j2", "steps": ["a"]}))).await;

        let (status, _) = call(
            &app,
            "POST",
            "/jobs/j2/updates",
            Some(json!({"status": "succeeded", "result": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = call(
            &app,
            "POST",
            "/jobs/j2/final",
            Some(json!({"status": "Succeeded", "result": {"y": 3}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "applied");

        let (_, body) = call(
            &app,
            "POST",
            "/jobs/j2/final",
            Some(json!({"status": "failed", "error": "late"})),
        )
        .await;
        assert_eq!(body["outcome"], "already_terminal");

        let (_, job) = call(&app, "GET", "/jobs/j2", None).await;
        assert_eq!(job["status"], "succeeded");
        assert_eq!(job["result"], json!({"y": 3}));
    }
}
