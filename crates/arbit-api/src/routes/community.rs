//! Community conversation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use arbit_core::Error as CoreError;
use arbit_core::community::CommunityService;
use arbit_core::observability::new_request_id;

use crate::error::ApiError;
use crate::routes::lenient_limit;
use crate::server::AppState;

fn community(state: &AppState) -> Result<&CommunityService, ApiError> {
    state
        .community
        .as_ref()
        .ok_or_else(|| ApiError::internal("community disabled"))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    // Accepted for forward compatibility; the feed is one page today.
    #[serde(default)]
    #[allow(dead_code)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<String>,
}

/// Handles `GET /api/community/conversations`.
pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let req_id = new_request_id();
    let community = match community(&state) {
        Ok(community) => community,
        Err(error) => return error.into_response(),
    };

    let limit = lenient_limit(query.limit.as_deref(), 20);
    tracing::info!(req_id = %req_id, limit, "community list");

    match community.list_conversations(limit).await {
        Ok(page) => {
            let mut response = Json(page).into_response();
            response.headers_mut().insert(
                header::CACHE_CONTROL,
                header::HeaderValue::from_static("public, max-age=10"),
            );
            response
        }
        Err(error) => {
            tracing::error!(req_id = %req_id, error = %error, "community list failed");
            ApiError::bad_gateway(error.to_string())
                .with_request_id(req_id)
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConversationVoteRequest {
    /// String-encoded conversation id.
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    delta: i32,
}

#[derive(Debug, Serialize)]
pub struct ConversationVoteResponse {
    conversation_id: i64,
    feedback_score: i32,
}

/// Handles `POST /api/community/conversations/vote`.
pub async fn vote_conversation(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ConversationVoteRequest>, JsonRejection>,
) -> Response {
    let community = match community(&state) {
        Ok(community) => community,
        Err(error) => return error.into_response(),
    };

    let Ok(Json(request)) = payload else {
        return ApiError::bad_request("bad json").into_response();
    };

    let Ok(conversation_id) = request.conversation_id.parse::<i64>() else {
        return ApiError::bad_request("conversation_id required").into_response();
    };
    if conversation_id == 0 {
        return ApiError::bad_request("conversation_id required").into_response();
    }
    if request.delta == 0 {
        return ApiError::bad_request("delta must be non-zero").into_response();
    }
    // The UI only ever sends -2..=2.
    if !(-2..=2).contains(&request.delta) {
        return ApiError::bad_request("delta out of range").into_response();
    }

    match community
        .add_feedback_score(conversation_id, request.delta)
        .await
    {
        Ok(feedback_score) => Json(ConversationVoteResponse {
            conversation_id,
            feedback_score,
        })
        .into_response(),
        Err(error @ CoreError::NotFound { .. }) => ApiError::from(error).into_response(),
        Err(error) => {
            tracing::error!(
                error = %error,
                conversation_id,
                delta = request.delta,
                "conversation vote failed"
            );
            ApiError::bad_gateway(error.to_string()).into_response()
        }
    }
}
