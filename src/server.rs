//! HTTP surface: `POST /run` and `POST /stream/run`.
//!
//! The streaming route emits the run's events as named SSE events with
//! JSON payloads. Client disconnect cancels the underlying run through
//! its cancellation token.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::Engine;
use crate::error::RunError;
use crate::planner::PlanOptions;

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub prompt: String,
    #[serde(default)]
    pub options: RunRequestOptions,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunRequestOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl From<RunRequestOptions> for PlanOptions {
    fn from(options: RunRequestOptions) -> Self {
        PlanOptions {
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        }
    }
}

/// Builds the application router.
pub fn app(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/run", post(run))
        .route("/stream/run", post(stream_run))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(engine)
}

/// Serves the API until the process exits.
pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, app(engine)).await
}

/// HTTP status for a run-level error, per the interface contract.
fn status_for(error: &RunError) -> StatusCode {
    match error {
        RunError::Plan(_) => StatusCode::BAD_REQUEST,
        RunError::AllCandidatesFailed { .. } => StatusCode::FAILED_DEPENDENCY,
        RunError::Timeout => StatusCode::REQUEST_TIMEOUT,
        // 499 is the de-facto "client closed request" status.
        RunError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        RunError::Configuration(_) | RunError::Journal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(error: &RunError) -> Response {
    let body = json!({
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
        }
    });
    (status_for(error), Json(body)).into_response()
}

async fn run(State(engine): State<Arc<Engine>>, Json(request): Json<RunRequest>) -> Response {
    match engine.run(&request.prompt, request.options.into()).await {
        Ok(outcome) => Json(json!({
            "content": outcome.content,
            "confidence": outcome.confidence,
            "stats": outcome.stats,
            "run_id": outcome.run_id,
            "warnings": outcome.warnings,
        }))
        .into_response(),
        Err(error) => error_body(&error),
    }
}

async fn stream_run(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<RunRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let cancel = CancellationToken::new();
    let (mut rx, handle) =
        engine.run_stream(request.prompt, request.options.into(), cancel.clone());

    // Dropping the stream (client disconnect) cancels the run.
    let guard = CancelOnDrop(cancel);

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            let payload = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().event(event.name()).data(payload));
        }
        if let Ok(Err(error)) = handle.await {
            let body = json!({
                "error": { "kind": error.kind(), "message": error.to_string() }
            });
            yield Ok(Event::default().event("error").data(body.to_string()));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlanError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&RunError::Plan(PlanError::Schema("x".into()))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&RunError::AllCandidatesFailed { summary: "x".into() }),
            StatusCode::FAILED_DEPENDENCY
        );
        assert_eq!(status_for(&RunError::Timeout), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(status_for(&RunError::Cancelled).as_u16(), 499);
        assert_eq!(
            status_for(&RunError::Configuration("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_run_request_options_default() {
        let request: RunRequest =
            serde_json::from_str(r#"{"prompt": "hello"}"#).expect("parses");
        assert_eq!(request.prompt, "hello");
        assert!(request.options.temperature.is_none());

        let with_options: RunRequest = serde_json::from_str(
            r#"{"prompt": "hello", "options": {"temperature": 0.5, "max_tokens": 100}}"#,
        )
        .expect("parses");
        assert_eq!(with_options.options.temperature, Some(0.5));
        assert_eq!(with_options.options.max_tokens, Some(100));
    }
}
