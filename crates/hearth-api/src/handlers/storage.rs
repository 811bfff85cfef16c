//! Signed object downloads.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::models::ApiError;
use crate::server::ApiState;

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
}

/// `GET /storage/:extension/*key?expires=&signature=`
pub async fn signed_download_handler(
    State(state): State<ApiState>,
    Path((extension, key)): Path<(String, String)>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, ApiError> {
    state
        .objects
        .verify(&extension, &key, query.expires, &query.signature)?;

    let (info, data) = state
        .objects
        .get(&extension, &key)?
        .ok_or_else(|| ApiError::not_found(format!("object {}/{}", extension, key)))?;

    let max_age = (query.expires - chrono::Utc::now().timestamp()).max(0);
    let content_type = info
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, format!("private, max-age={}", max_age)),
        ],
        data,
    )
        .into_response())
}
