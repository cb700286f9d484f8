//! The infer endpoint: rate-limited, backpressured, deadline-bounded.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use arbit_core::dispatcher::{EnqueueError, InferenceJob, InferenceRequest};
use arbit_core::observability::new_request_id;
use arbit_core::providers::ProviderError;

use crate::error::ApiError;
use crate::metrics::{record_infer_request, record_infer_timings};
use crate::server::AppState;

/// Success body for one inference.
#[derive(Debug, Serialize)]
pub struct InferResponse {
    /// Completion text.
    pub text: String,
    /// Provider that produced it.
    pub provider: String,
    /// Total tokens reported by the provider.
    pub token_usage: u32,
}

/// Handles `POST /api/infer`.
///
/// One observation lands on the request counter for every branch; the
/// latency histograms record only successes.
pub async fn infer(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<InferenceRequest>, JsonRejection>,
) -> Response {
    let req_id = new_request_id();

    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::warn!(req_id = %req_id, error = %rejection.body_text(), "bad json");
            record_infer_request(StatusCode::BAD_REQUEST, "unknown", "unknown");
            return ApiError::bad_request("bad json")
                .with_request_id(req_id)
                .into_response();
        }
    };

    if request.prompt.is_empty() {
        tracing::warn!(req_id = %req_id, "validation error: empty prompt");
        record_infer_request(StatusCode::BAD_REQUEST, "unknown", &request.model);
        return ApiError::bad_request("prompt is required")
            .with_request_id(req_id)
            .into_response();
    }

    let Some(dispatcher) = state.dispatcher.as_ref() else {
        record_infer_request(StatusCode::INTERNAL_SERVER_ERROR, "unknown", &request.model);
        return ApiError::internal("inference disabled")
            .with_request_id(req_id)
            .into_response();
    };

    let model = request.model.clone();
    let cancel = CancellationToken::new();
    // Cancels the scope when this handler is dropped mid-flight (client
    // disconnect) as well as on normal return, by which point the job is
    // already settled.
    let _guard = cancel.clone().drop_guard();

    let (job, reply) = InferenceJob::new(request, cancel.clone());
    let (stats, enqueued) = dispatcher.try_enqueue(job);

    match enqueued {
        Ok(()) => {}
        Err(EnqueueError::QueueFull) => {
            tracing::warn!(
                req_id = %req_id,
                model = %model,
                queue_cap = stats.cap,
                queue_len = stats.len,
                "queue full"
            );
            record_infer_request(StatusCode::TOO_MANY_REQUESTS, "unknown", &model);
            return ApiError::too_many_requests("QUEUE_FULL", "busy; try again")
                .with_request_id(req_id)
                .into_response();
        }
        Err(EnqueueError::Closed) => {
            tracing::warn!(req_id = %req_id, model = %model, "enqueue after shutdown");
            record_infer_request(StatusCode::INTERNAL_SERVER_ERROR, "unknown", &model);
            return ApiError::internal("shutting down")
                .with_request_id(req_id)
                .into_response();
        }
    }

    tracing::info!(
        req_id = %req_id,
        model = %model,
        queue_cap = stats.cap,
        queue_len = stats.len,
        "enqueued"
    );

    // Wait for the worker or the deadline, whichever comes first. The
    // reply slot is buffered, so a worker finishing after abandonment
    // never blocks.
    let result = tokio::select! {
        result = reply => result,
        () = tokio::time::sleep(state.config.request_timeout) => {
            cancel.cancel();
            tracing::warn!(req_id = %req_id, model = %model, "deadline before result");
            record_infer_request(StatusCode::GATEWAY_TIMEOUT, "unknown", &model);
            return ApiError::gateway_timeout("request cancelled/timeout")
                .with_request_id(req_id)
                .into_response();
        }
    };

    let Ok(result) = result else {
        // The dispatcher guarantees one reply per accepted job; a dropped
        // sender means the process is tearing down.
        record_infer_request(StatusCode::INTERNAL_SERVER_ERROR, "unknown", &model);
        return ApiError::internal("dispatcher dropped the job")
            .with_request_id(req_id)
            .into_response();
    };

    match result.outcome {
        Ok(reply) => {
            tracing::info!(
                req_id = %req_id,
                provider = %reply.provider,
                model = %model,
                queue_wait_ms = result.queue_wait.as_millis() as u64,
                exec_ms = result.exec_time.as_millis() as u64,
                total_ms = (result.queue_wait + result.exec_time).as_millis() as u64,
                token_usage = reply.token_usage,
                "ok"
            );
            record_infer_request(StatusCode::OK, &reply.provider, &model);
            record_infer_timings(&reply.provider, &model, result.queue_wait, result.exec_time);
            (
                StatusCode::OK,
                Json(InferResponse {
                    text: reply.text,
                    provider: reply.provider,
                    token_usage: reply.token_usage,
                }),
            )
                .into_response()
        }
        Err(ProviderError::Cancelled) => {
            tracing::warn!(req_id = %req_id, model = %model, "request cancelled before completion");
            record_infer_request(StatusCode::GATEWAY_TIMEOUT, "unknown", &model);
            ApiError::gateway_timeout("request cancelled/timeout")
                .with_request_id(req_id)
                .into_response()
        }
        Err(error @ ProviderError::Upstream { .. }) => {
            let provider = error.provider().to_string();
            tracing::warn!(
                req_id = %req_id,
                provider = %provider,
                model = %model,
                error = %error,
                "provider error"
            );
            record_infer_request(StatusCode::BAD_GATEWAY, &provider, &model);
            ApiError::bad_gateway(error.to_string())
                .with_request_id(req_id)
                .into_response()
        }
    }
}
