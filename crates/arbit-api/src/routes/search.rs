//! Pair search endpoint over the derived index.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use arbit_core::Error as CoreError;
use arbit_core::search::SearchParams;

use crate::error::ApiError;
use crate::routes::lenient_limit;
use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    sort: Option<String>,
    #[serde(default)]
    visibility: Option<String>,
    #[serde(default)]
    limit: Option<String>,
}

/// Handles `GET /api/search/pairs`.
pub async fn search_pairs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let Some(search) = state.search.as_ref() else {
        return ApiError::internal("search disabled").into_response();
    };

    let limit = lenient_limit(query.limit.as_deref(), 20);
    let params = SearchParams {
        q: query.q.unwrap_or_default(),
        cursor: query.cursor.unwrap_or_default(),
        sort: query.sort.unwrap_or_default(),
        visibility: query.visibility.unwrap_or_default(),
        limit: usize::try_from(limit.max(0)).unwrap_or_default(),
    };

    match search.search_pairs(params).await {
        Ok(page) => Json(page).into_response(),
        Err(error @ CoreError::InvalidInput(_)) => {
            ApiError::from(error).into_response()
        }
        Err(error) => {
            tracing::error!(error = %error, "pair search failed");
            ApiError::bad_gateway(error.to_string()).into_response()
        }
    }
}
