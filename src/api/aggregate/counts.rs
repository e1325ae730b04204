use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::api::{bad_request, internal_error, ApiError, AppState, ErrorResponse, SinceQuery};
use crate::query::{AggregateRow, Granularity};

/// Count records per time bucket and status
#[utoipa::path(
    get,
    path = "/api/aggregate/{granularity}",
    params(
        ("granularity" = String, Path, description = "One of hour, day, month, year, hour_of_day (alias hour_overall), weekday"),
        SinceQuery
    ),
    responses(
        (status = 200, description = "Counts ordered by bucket then status", body = Vec<AggregateRow>),
        (status = 400, description = "Unsupported granularity or malformed since parameter", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "aggregate"
)]
pub async fn aggregate_results(
    State(state): State<AppState>,
    Path(granularity): Path<String>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<Vec<AggregateRow>>, ApiError> {
    let granularity: Granularity = granularity.parse().map_err(bad_request)?;
    let since = query.parse()?;

    let rows = state
        .query
        .aggregate(granularity, since)
        .await
        .map_err(internal_error)?;

    Ok(Json(rows))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{app, get_json};
    use crate::models::Status;
    use crate::store::tests::{memory_store, new_record};
    use crate::store::ObservationStore;
    use axum::http::StatusCode;
    use serde_json::json;

    async fn seeded() -> ObservationStore {
        let store = memory_store().await;
        for (num, date, status) in [
            ("123", "2017-02-12 01:01:00", Status::Normal),
            ("256", "2017-02-12 01:01:00", Status::Retard),
            ("789", "2017-02-12 01:01:00", Status::Retard),
            ("123", "2017-02-11 01:01:00", Status::Normal),
            ("256", "2017-02-11 01:01:00", Status::Suppr),
        ] {
            store.insert(new_record(num, date, status)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_aggregate_by_day() {
        let (status, body) = get_json(app(seeded().await), "/api/aggregate/day").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([
                {"bucket": "2017-02-11", "status": "NORMAL", "count": 1},
                {"bucket": "2017-02-11", "status": "SUPPR", "count": 1},
                {"bucket": "2017-02-12", "status": "NORMAL", "count": 1},
                {"bucket": "2017-02-12", "status": "RETARD", "count": 2},
            ])
        );
    }

    #[tokio::test]
    async fn test_aggregate_hour_overall_alias() {
        let (status, body) = get_json(app(seeded().await), "/api/aggregate/hour_overall").await;
        assert_eq!(status, StatusCode::OK);
        let buckets: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["bucket"].as_str().unwrap().to_string())
            .collect();
        assert!(buckets.iter().all(|b| b == "01"));
    }

    #[tokio::test]
    async fn test_aggregate_empty_store() {
        let (status, body) = get_json(app(memory_store().await), "/api/aggregate/month").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_unsupported_granularity() {
        let (status, body) = get_json(app(memory_store().await), "/api/aggregate/minute").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("minute"));
    }

    #[tokio::test]
    async fn test_missing_granularity() {
        let (status, _) = get_json(app(memory_store().await), "/api/aggregate").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_aggregate_malformed_since() {
        let (status, _) = get_json(app(seeded().await), "/api/aggregate/day?since=soon").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
