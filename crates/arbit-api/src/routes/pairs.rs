//! Pair evaluation endpoints: random pair and vote recording.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use arbit_core::Error as CoreError;
use arbit_core::voting::{Choice, VotingService};

use crate::error::ApiError;
use crate::server::AppState;

// Vote and pair reads are interactive; anything slower is broken.
const SERVICE_TIMEOUT: Duration = Duration::from_secs(3);

fn voting(state: &AppState) -> Result<&VotingService, ApiError> {
    state
        .voting
        .as_ref()
        .ok_or_else(|| ApiError::internal("voting disabled"))
}

#[derive(Debug, Deserialize)]
pub struct RandomPairParams {
    #[serde(rename = "promptId")]
    prompt_id: Option<String>,
}

/// Handles `GET /api/pairs/random`.
pub async fn random_pair(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RandomPairParams>,
) -> Response {
    let voting = match voting(&state) {
        Ok(voting) => voting,
        Err(error) => return error.into_response(),
    };

    let prompt_id = match params.prompt_id.as_deref() {
        None | Some("") => None,
        Some(raw) => match raw.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => return ApiError::bad_request("invalid promptId").into_response(),
        },
    };

    let pair = tokio::time::timeout(SERVICE_TIMEOUT, voting.random_pair(prompt_id)).await;
    match pair {
        Ok(Ok(pair)) => Json(pair).into_response(),
        Ok(Err(CoreError::NotFound { .. })) => {
            ApiError::not_found("no pairs available").into_response()
        }
        Ok(Err(error)) => {
            tracing::error!(error = %error, "random pair failed");
            ApiError::internal("server error").into_response()
        }
        Err(_) => ApiError::gateway_timeout("request timed out").into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateVoteRequest {
    #[serde(rename = "pairId", default)]
    pair_id: i64,
    #[serde(rename = "voterId", default)]
    voter_id: String,
    #[serde(default)]
    choice: String,
}

#[derive(Debug, Serialize)]
pub struct CreateVoteResponse {
    status: &'static str,
}

fn parse_choice(raw: &str) -> Option<Choice> {
    match raw {
        "A" => Some(Choice::A),
        "B" => Some(Choice::B),
        "TIE" => Some(Choice::Tie),
        _ => None,
    }
}

/// Handles `POST /api/votes`.
pub async fn create_vote(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateVoteRequest>, JsonRejection>,
) -> Response {
    let voting = match voting(&state) {
        Ok(voting) => voting,
        Err(error) => return error.into_response(),
    };

    let Ok(Json(request)) = payload else {
        return ApiError::bad_request("invalid json").into_response();
    };

    if request.pair_id <= 0 || request.voter_id.is_empty() {
        return ApiError::bad_request("pairId and voterId required").into_response();
    }

    let Some(choice) = parse_choice(&request.choice) else {
        return ApiError::bad_request("choice must be A, B, or TIE").into_response();
    };

    let status = tokio::time::timeout(
        SERVICE_TIMEOUT,
        voting.create_vote(request.pair_id, &request.voter_id, choice),
    )
    .await;

    match status {
        Ok(Ok(status)) => Json(CreateVoteResponse {
            status: status.as_str(),
        })
        .into_response(),
        Ok(Err(error)) => {
            tracing::error!(error = %error, pair_id = request.pair_id, "create vote failed");
            ApiError::internal("server error").into_response()
        }
        Err(_) => ApiError::gateway_timeout("request timed out").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice_accepts_exact_wire_values() {
        assert_eq!(parse_choice("A"), Some(Choice::A));
        assert_eq!(parse_choice("B"), Some(Choice::B));
        assert_eq!(parse_choice("TIE"), Some(Choice::Tie));
        assert_eq!(parse_choice("tie"), None);
        assert_eq!(parse_choice(""), None);
    }
}
