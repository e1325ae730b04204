use chrono::{NaiveDateTime, Timelike};
use serde::{Serialize, Serializer};
use utoipa::ToSchema;

use crate::time_codec;

/// One sighting of a train as reported by the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub train_number: String,
    pub mission_code: String,
    pub terminus_code: Option<i64>,
    /// Scheduled time, or actual time once the feed reports a delay
    pub time: NaiveDateTime,
    /// Feed status token, absent when the train is on time
    pub raw_status: Option<String>,
    pub from_station: String,
    pub to_station: String,
}

/// Reconciled status of a train
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Normal,
    /// Delayed
    Retard,
    /// Cancelled
    Suppr,
    /// Unrecognised feed token, kept verbatim
    Other(String),
}

type StatusRule = (fn(&str) -> bool, Status);

/// Evaluated top to bottom, first match wins. Matching is case-sensitive.
const STATUS_RULES: [StatusRule; 3] = [
    (str::is_empty, Status::Normal),
    (is_cancellation, Status::Suppr),
    (is_delay, Status::Retard),
];

fn is_cancellation(raw: &str) -> bool {
    raw.starts_with("Suppr") || raw == "S"
}

fn is_delay(raw: &str) -> bool {
    raw.starts_with("Retard") || raw == "R"
}

impl Status {
    /// Classify a feed status token. Returns the status and the raw text to
    /// store alongside it (empty when the token is absent).
    pub fn classify(raw: Option<&str>) -> (Status, String) {
        let raw = raw.unwrap_or_default();
        let status = STATUS_RULES
            .iter()
            .find(|(matches, _)| matches(raw))
            .map(|(_, status)| status.clone())
            .unwrap_or_else(|| Status::Other(raw.to_string()));
        (status, raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Status::Normal => "NORMAL",
            Status::Retard => "RETARD",
            Status::Suppr => "SUPPR",
            Status::Other(raw) => raw,
        }
    }

    /// Discriminator stored next to `as_str`, so an unknown token spelled
    /// like a known status still reads back as `Other`
    pub fn kind(&self) -> &'static str {
        match self {
            Status::Normal => "normal",
            Status::Retard => "retard",
            Status::Suppr => "suppr",
            Status::Other(_) => "other",
        }
    }

    /// Inverse of (`kind`, `as_str`), used when reading rows back
    pub fn from_stored(kind: &str, text: &str) -> Status {
        match kind {
            "normal" => Status::Normal,
            "retard" => Status::Retard,
            "suppr" => Status::Suppr,
            _ => Status::Other(text.to_string()),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Durable, reconciled state of one physical train
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Record {
    pub id: i64,
    pub train_number: String,
    #[serde(serialize_with = "serialize_canonical")]
    #[schema(value_type = String, example = "2020-01-01 08:00:00")]
    pub date: NaiveDateTime,
    /// ISO weekday of `date`, Monday = 1
    pub weekday: u8,
    #[schema(value_type = String, example = "RETARD")]
    pub status: Status,
    pub raw_status: String,
    pub delay_seconds: Option<i64>,
    pub from_station: String,
    pub to_station: String,
    pub mission_code: String,
    pub terminus_code: Option<i64>,
}

/// A record before the store has assigned it an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub train_number: String,
    pub date: NaiveDateTime,
    pub weekday: u8,
    pub status: Status,
    pub raw_status: String,
    pub delay_seconds: Option<i64>,
    pub from_station: String,
    pub to_station: String,
    pub mission_code: String,
    pub terminus_code: Option<i64>,
}

impl NewRecord {
    pub fn from_observation(obs: &Observation) -> Self {
        let (status, raw_status) = Status::classify(obs.raw_status.as_deref());
        // Feed precision is minutes
        let date = obs
            .time
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(obs.time);

        Self {
            train_number: obs.train_number.clone(),
            date,
            weekday: time_codec::weekday_of(&date),
            status,
            raw_status,
            delay_seconds: None,
            from_station: obs.from_station.clone(),
            to_station: obs.to_station.clone(),
            mission_code: obs.mission_code.clone(),
            terminus_code: obs.terminus_code,
        }
    }

    pub fn with_id(self, id: i64) -> Record {
        Record {
            id,
            train_number: self.train_number,
            date: self.date,
            weekday: self.weekday,
            status: self.status,
            raw_status: self.raw_status,
            delay_seconds: self.delay_seconds,
            from_station: self.from_station,
            to_station: self.to_station,
            mission_code: self.mission_code,
            terminus_code: self.terminus_code,
        }
    }
}

/// Fields of a record that may change while its dedup window is open.
/// Train number and stations are deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub status: Option<Status>,
    pub raw_status: Option<String>,
    pub delay_seconds: Option<i64>,
}

impl RecordUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.raw_status.is_none() && self.delay_seconds.is_none()
    }

    /// Apply to an in-memory copy, mirroring what the store persists
    pub fn apply_to(&self, record: &mut Record) {
        if let Some(status) = &self.status {
            record.status = status.clone();
        }
        if let Some(raw_status) = &self.raw_status {
            record.raw_status = raw_status.clone();
        }
        if let Some(delay) = self.delay_seconds {
            record.delay_seconds = Some(delay);
        }
    }
}

/// Rider-facing change worth a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationIntent {
    NewCancellation,
    Reinstatement,
}

impl NotificationIntent {
    /// Flag passed to the notification sink
    pub fn cancelled(self) -> bool {
        matches!(self, NotificationIntent::NewCancellation)
    }
}

fn serialize_canonical<S: Serializer>(date: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&time_codec::to_canonical(date))
}
