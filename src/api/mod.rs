pub mod aggregate;
pub mod error;
pub mod results;

pub use error::{bad_request, internal_error, ApiError, ErrorResponse};

use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::{IntoParams, OpenApi};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::config::Stations;
use crate::query::QueryService;
use crate::time_codec;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "trainflag",
        description = "Reconciled train observations and status aggregates for a watched route"
    ),
    tags(
        (name = "results", description = "Stored train records"),
        (name = "aggregate", description = "Record counts by time bucket and status")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub query: QueryService,
    pub stations: Arc<Stations>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SinceQuery {
    /// Only include trains dated after this unix timestamp (seconds)
    pub since: Option<String>,
}

impl SinceQuery {
    /// `Ok(None)` when absent; a value that is not a unix timestamp is a client error
    pub fn parse(&self) -> Result<Option<chrono::NaiveDateTime>, ApiError> {
        let Some(raw) = self.since.as_deref() else {
            return Ok(None);
        };
        let secs: i64 = raw
            .trim()
            .parse()
            .map_err(|_| bad_request(format!("Invalid since timestamp: {raw:?}")))?;
        time_codec::from_unix_seconds(secs)
            .map(Some)
            .ok_or_else(|| bad_request(format!("since timestamp out of range: {secs}")))
    }
}

/// Build the API router and its OpenAPI document
pub fn router(state: AppState) -> (Router, utoipa::openapi::OpenApi) {
    OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(results::list_results))
        .routes(routes!(aggregate::aggregate_results))
        .with_state(state)
        .split_for_parts()
}
