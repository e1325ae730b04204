use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Duration;
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::{internal_error, ApiError, AppState, ErrorResponse, SinceQuery};
use crate::models::Record;
use crate::time_codec;

/// Human-readable names of the watched route's ends
#[derive(Debug, Serialize, ToSchema)]
pub struct RouteInfo {
    pub from_station: String,
    pub to_station: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResultsResponse {
    /// Trains from the origin station to the destination, newest first
    pub outbound: Vec<Record>,
    /// Trains on the way back
    pub inbound: Vec<Record>,
    pub infos: RouteInfo,
}

/// List recent trains in both directions of the watched route
#[utoipa::path(
    get,
    path = "/api",
    params(SinceQuery),
    responses(
        (status = 200, description = "Records per direction, defaulting to the last 24 hours", body = ResultsResponse),
        (status = 400, description = "Malformed since parameter", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "results"
)]
pub async fn list_results(
    State(state): State<AppState>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let since = query
        .parse()?
        .unwrap_or_else(|| time_codec::now() - Duration::days(1));

    let stations = &state.stations;
    let outbound = state
        .query
        .list_direction(&stations.from.code, since)
        .await
        .map_err(internal_error)?;
    let inbound = state
        .query
        .list_direction(&stations.to.code, since)
        .await
        .map_err(internal_error)?;

    Ok(Json(ResultsResponse {
        outbound,
        inbound,
        infos: RouteInfo {
            from_station: stations.from.label.clone(),
            to_station: stations.to.label.clone(),
        },
    }))
}
