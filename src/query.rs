use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::FromRow;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::models::Record;
use crate::store::{rows_to_records, ObservationStore, RecordRow, StoreError, RECORD_COLUMNS};
use crate::time_codec;

/// Time bucket used to group aggregate counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// `YYYY-MM-DD HH`
    Hour,
    /// `YYYY-MM-DD`
    Day,
    /// `YYYY-MM`
    Month,
    /// `YYYY`
    Year,
    /// `HH`, all days merged
    HourOfDay,
    /// ISO weekday, `1`..`7`
    Weekday,
}

impl Granularity {
    /// SQL expression yielding the bucket label of a row
    fn bucket_expr(&self) -> &'static str {
        match self {
            Granularity::Hour => "substr(date, 1, 13)",
            Granularity::Day => "substr(date, 1, 10)",
            Granularity::Month => "substr(date, 1, 7)",
            Granularity::Year => "substr(date, 1, 4)",
            Granularity::HourOfDay => "substr(date, 12, 2)",
            Granularity::Weekday => "CAST(weekday AS TEXT)",
        }
    }
}

impl FromStr for Granularity {
    type Err = UnsupportedGranularity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "month" => Ok(Granularity::Month),
            "year" => Ok(Granularity::Year),
            "hour_of_day" | "hour_overall" => Ok(Granularity::HourOfDay),
            "weekday" => Ok(Granularity::Weekday),
            other => Err(UnsupportedGranularity(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported granularity {0:?}")]
pub struct UnsupportedGranularity(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema, FromRow)]
pub struct AggregateRow {
    pub bucket: String,
    pub status: String,
    pub count: i64,
}

/// Read-only queries over stored records
#[derive(Debug, Clone)]
pub struct QueryService {
    store: ObservationStore,
}

impl QueryService {
    pub fn new(store: ObservationStore) -> Self {
        Self { store }
    }

    /// Records leaving `from_station` dated after `since`, newest first
    pub async fn list_direction(
        &self,
        from_station: &str,
        since: NaiveDateTime,
    ) -> Result<Vec<Record>, StoreError> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM results
            WHERE from_station = ? AND date > ?
            ORDER BY date DESC, id DESC
            "#
        ))
        .bind(from_station)
        .bind(time_codec::to_canonical(&since))
        .fetch_all(self.store.pool())
        .await?;

        rows_to_records(rows)
    }

    /// Record counts per bucket and status, optionally restricted to dates after `since`
    pub async fn aggregate(
        &self,
        granularity: Granularity,
        since: Option<NaiveDateTime>,
    ) -> Result<Vec<AggregateRow>, StoreError> {
        let bucket = granularity.bucket_expr();
        let filter = if since.is_some() { "WHERE date > ?" } else { "" };
        let sql = format!(
            r#"
            SELECT {bucket} AS bucket, status, COUNT(*) AS count
            FROM results
            {filter}
            GROUP BY {bucket}, status
            ORDER BY bucket, status
            "#
        );

        let mut query = sqlx::query_as::<_, AggregateRow>(&sql);
        if let Some(since) = since {
            query = query.bind(time_codec::to_canonical(&since));
        }

        Ok(query.fetch_all(self.store.pool()).await?)
    }
}
