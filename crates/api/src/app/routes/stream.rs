//! Live job stream over Server-Sent Events.
//!
//! Replays the job's update log, then tails live updates, and closes after
//! the terminal one. Each update is an `update` event carrying the
//! [`JobUpdate`](hopline_core::JobUpdate) as JSON, with the sequence number
//! as the SSE id.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
};
use tokio_stream::StreamExt;
use tracing::debug;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// GET /jobs/:id/stream
pub async fn stream_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let updates = match services.lifecycle().stream(&job_id).await {
        Ok(stream) => stream,
        Err(e) => return errors::store_error_to_response(e),
    };
    debug!(job_id = %job_id, "stream subscriber attached");

    let events = updates.map(|update| {
        let data = serde_json::to_string(&update).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, Infallible>(
            SseEvent::default()
                .event("update")
                .id(update.sequence.to_string())
                .data(data),
        )
    });

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}
