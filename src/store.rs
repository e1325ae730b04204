use chrono::NaiveDateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::models::{NewRecord, Record, RecordUpdate, Status};
use crate::time_codec;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    train_number TEXT NOT NULL,
    date TEXT NOT NULL,
    weekday INTEGER NOT NULL,
    status TEXT NOT NULL,
    status_kind TEXT NOT NULL,
    raw_status TEXT NOT NULL DEFAULT '',
    delay_seconds INTEGER,
    from_station TEXT NOT NULL,
    to_station TEXT NOT NULL,
    mission_code TEXT NOT NULL DEFAULT '',
    terminus_code INTEGER
);
CREATE INDEX IF NOT EXISTS idx_results_train_date ON results (train_number, date);
CREATE INDEX IF NOT EXISTS idx_results_from_date ON results (from_station, date);
"#;

pub(crate) const RECORD_COLUMNS: &str = "id, train_number, date, weekday, status, status_kind, raw_status, delay_seconds, \
     from_station, to_station, mission_code, terminus_code";

/// Internal struct for database row
#[derive(Debug, FromRow)]
pub(crate) struct RecordRow {
    id: i64,
    train_number: String,
    date: String,
    weekday: i64,
    status: String,
    status_kind: String,
    raw_status: String,
    delay_seconds: Option<i64>,
    from_station: String,
    to_station: String,
    mission_code: String,
    terminus_code: Option<i64>,
}

impl TryFrom<RecordRow> for Record {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let date = time_codec::parse_canonical(&row.date).map_err(|e| StoreError::InvalidRow {
            id: row.id,
            reason: e.to_string(),
        })?;
        let weekday = u8::try_from(row.weekday)
            .ok()
            .filter(|w| (1..=7).contains(w))
            .ok_or_else(|| StoreError::InvalidRow {
                id: row.id,
                reason: format!("weekday out of range: {}", row.weekday),
            })?;

        Ok(Record {
            id: row.id,
            train_number: row.train_number,
            date,
            weekday,
            status: Status::from_stored(&row.status_kind, &row.status),
            raw_status: row.raw_status,
            delay_seconds: row.delay_seconds,
            from_station: row.from_station,
            to_station: row.to_station,
            mission_code: row.mission_code,
            terminus_code: row.terminus_code,
        })
    }
}

pub(crate) fn rows_to_records(rows: Vec<RecordRow>) -> Result<Vec<Record>, StoreError> {
    rows.into_iter().map(Record::try_from).collect()
}

/// Persistent store of reconciled train records.
///
/// Cheap to clone: clones share the pool and the write lock, so one instance
/// is built at startup and handed to every component.
#[derive(Debug, Clone)]
pub struct ObservationStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl ObservationStore {
    /// Open (creating if needed) the database at `database_url` and ensure the schema exists
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Each connection to an in-memory database sees its own empty database
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        info!(database_url = %database_url, "Connected to database");
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Exclusive right to a read-then-write sequence. Held by the reconciler
    /// so two sightings of one train cannot both decide to insert.
    pub async fn lock_writes(&self) -> OwnedMutexGuard<()> {
        self.write_lock.clone().lock_owned().await
    }

    /// Most recent record for `train_number` dated strictly after `window_start`.
    ///
    /// `Ok(None)` means no such record (including an empty database);
    /// an unreachable database is an `Err`.
    pub async fn find_active(
        &self,
        train_number: &str,
        window_start: NaiveDateTime,
    ) -> Result<Option<Record>, StoreError> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM results
            WHERE train_number = ? AND date > ?
            ORDER BY date DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(train_number)
        .bind(time_codec::to_canonical(&window_start))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Record::try_from).transpose()
    }

    pub async fn get(&self, id: i64) -> Result<Record, StoreError> {
        let row: Option<RecordRow> =
            sqlx::query_as(&format!("SELECT {RECORD_COLUMNS} FROM results WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    pub async fn insert(&self, record: NewRecord) -> Result<Record, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO results (
                train_number, date, weekday, status, status_kind, raw_status,
                delay_seconds, from_station, to_station, mission_code, terminus_code
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&record.train_number)
        .bind(time_codec::to_canonical(&record.date))
        .bind(record.weekday as i64)
        .bind(record.status.as_str())
        .bind(record.status.kind())
        .bind(&record.raw_status)
        .bind(record.delay_seconds)
        .bind(&record.from_station)
        .bind(&record.to_station)
        .bind(&record.mission_code)
        .bind(record.terminus_code)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = sqlx::Row::get(&row, "id");
        debug!(id, train = %record.train_number, status = %record.status, "Inserted record");

        Ok(record.with_id(id))
    }

    /// Persist only the fields set in `update`
    pub async fn update_fields(&self, id: i64, update: &RecordUpdate) -> Result<(), StoreError> {
        if update.is_empty() {
            // Still surface a missing id
            return self.get(id).await.map(|_| ());
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE results SET ");
        let mut fields = query.separated(", ");
        if let Some(status) = &update.status {
            fields.push("status = ");
            fields.push_bind_unseparated(status.as_str().to_string());
            fields.push("status_kind = ");
            fields.push_bind_unseparated(status.kind());
        }
        if let Some(raw_status) = &update.raw_status {
            fields.push("raw_status = ");
            fields.push_bind_unseparated(raw_status.clone());
        }
        if let Some(delay) = update.delay_seconds {
            fields.push("delay_seconds = ");
            fields.push_bind_unseparated(delay);
        }
        query.push(" WHERE id = ");
        query.push_bind(id);

        let result = query.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        debug!(id, ?update, "Updated record");
        Ok(())
    }

    pub async fn count_for(&self, train_number: &str) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM results WHERE train_number = ?")
            .bind(train_number)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM results")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record {0} not found")]
    NotFound(i64),
    #[error("Invalid stored record {id}: {reason}")]
    InvalidRow { id: i64, reason: String },
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
