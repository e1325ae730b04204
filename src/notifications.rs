//! Rider notifications for cancellations and reinstatements.
//!
//! Delivery is best-effort: the reconciler logs a failed send and moves on,
//! the stored record stays authoritative.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{NotificationConfig, PushbulletConfig, Stations};
use crate::models::Record;
use crate::time_codec;

const PUSHBULLET_API_URL: &str = "https://api.pushbullet.com";

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// `cancelled` is true for a new cancellation, false for a reinstatement
    async fn send(&self, record: &Record, cancelled: bool) -> Result<(), NotificationError>;
}

/// Title and body of a rider-facing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub title: String,
    pub body: String,
}

impl Message {
    pub fn build(record: &Record, cancelled: bool, stations: &Stations) -> Result<Self, NotificationError> {
        let from = translate_station(stations, &record.from_station)?;
        let to = translate_station(stations, &record.to_station)?;
        let date = time_codec::to_canonical(&record.date);
        let prefix = if cancelled { "" } else { "[ANNULATION] " };
        let outcome = if cancelled {
            "supprimé"
        } else {
            "remis en service"
        };

        Ok(Self {
            title: format!("{prefix}{date} {from} > {to}"),
            body: format!("Le train de {date} ({from} - {to}) a été {outcome}."),
        })
    }
}

fn translate_station<'a>(stations: &'a Stations, code: &str) -> Result<&'a str, NotificationError> {
    stations
        .label_for(code)
        .ok_or_else(|| NotificationError::UnknownStation(code.to_string()))
}

/// Writes each notification to the log
pub struct LogNotifier {
    stations: Stations,
}

impl LogNotifier {
    pub fn new(stations: Stations) -> Self {
        Self { stations }
    }
}

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn send(&self, record: &Record, cancelled: bool) -> Result<(), NotificationError> {
        let message = Message::build(record, cancelled, &self.stations)?;
        info!(
            train = %record.train_number,
            cancelled,
            title = %message.title,
            "{}",
            message.body
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PushbulletNote<'a> {
    #[serde(rename = "type")]
    push_type: &'static str,
    title: &'a str,
    body: &'a str,
    channel_tag: &'a str,
}

/// Pushes a note to a Pushbullet channel
pub struct PushbulletNotifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    channel: String,
    stations: Stations,
}

impl PushbulletNotifier {
    pub fn new(config: &PushbulletConfig, stations: Stations) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| NotificationError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| PUSHBULLET_API_URL.to_string()),
            api_key: config.api_key.clone(),
            channel: config.channel.clone(),
            stations,
        })
    }
}

#[async_trait]
impl NotificationSink for PushbulletNotifier {
    async fn send(&self, record: &Record, cancelled: bool) -> Result<(), NotificationError> {
        let message = Message::build(record, cancelled, &self.stations)?;
        let url = format!("{}/v2/pushes", self.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("Access-Token", &self.api_key)
            .json(&PushbulletNote {
                push_type: "note",
                title: &message.title,
                body: &message.body,
                channel_tag: &self.channel,
            })
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        info!(train = %record.train_number, channel = %self.channel, "Sent Pushbullet note");
        Ok(())
    }
}

/// Fans a notification out to every configured sink
#[derive(Clone, Default)]
pub struct Notifiers {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Notifiers {
    pub fn from_config(config: &NotificationConfig, stations: &Stations) -> Result<Self, NotificationError> {
        let mut notifiers = Self::default();
        if config.log {
            notifiers.push(Arc::new(LogNotifier::new(stations.clone())));
        }
        if let Some(pushbullet) = &config.pushbullet {
            notifiers.push(Arc::new(PushbulletNotifier::new(pushbullet, stations.clone())?));
        }
        Ok(notifiers)
    }

    pub fn push(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }
}

#[async_trait]
impl NotificationSink for Notifiers {
    /// Every sink is tried; the first failure is returned after the rest have run
    async fn send(&self, record: &Record, cancelled: bool) -> Result<(), NotificationError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.send(record, cancelled).await {
                warn!(train = %record.train_number, error = %e, "Notification sink failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Unknown station code {0}")]
    UnknownStation(String),
    #[error("Notification transport error: {0}")]
    Transport(String),
    #[error("Notification rejected with status {status}: {body}")]
    Status { status: u16, body: String },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Station;
    use crate::models::Status;
    use std::sync::Mutex;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records every call; optionally fails each one
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub calls: Mutex<Vec<(String, bool)>>,
        pub fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(&self, record: &Record, cancelled: bool) -> Result<(), NotificationError> {
            self.calls
                .lock()
                .unwrap()
                .push((record.train_number.clone(), cancelled));
            if self.fail {
                Err(NotificationError::Transport("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    pub(crate) fn stations() -> Stations {
        Stations {
            from: Station {
                code: "87381509".into(),
                label: "Poissy".into(),
            },
            to: Station {
                code: "87384008".into(),
                label: "Paris Saint-Lazare".into(),
            },
        }
    }

    fn record() -> Record {
        Record {
            id: 1,
            train_number: "148614".into(),
            date: time_codec::parse_canonical("2020-01-01 08:00:00").unwrap(),
            weekday: 3,
            status: Status::Suppr,
            raw_status: "S".into(),
            delay_seconds: None,
            from_station: "87381509".into(),
            to_station: "87384008".into(),
            mission_code: "POPI".into(),
            terminus_code: None,
        }
    }

    #[test]
    fn test_cancellation_message() {
        let message = Message::build(&record(), true, &stations()).unwrap();
        assert_eq!(message.title, "2020-01-01 08:00:00 Poissy > Paris Saint-Lazare");
        assert_eq!(
            message.body,
            "Le train de 2020-01-01 08:00:00 (Poissy - Paris Saint-Lazare) a été supprimé."
        );
    }

    #[test]
    fn test_reinstatement_message() {
        let message = Message::build(&record(), false, &stations()).unwrap();
        assert!(message.title.starts_with("[ANNULATION] "));
        assert!(message.body.ends_with("a été remis en service."));
    }

    #[test]
    fn test_unknown_station() {
        let mut record = record();
        record.to_station = "1".into();
        assert!(matches!(
            Message::build(&record, true, &stations()),
            Err(NotificationError::UnknownStation(code)) if code == "1"
        ));
    }

    #[tokio::test]
    async fn test_pushbullet_posts_note() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/pushes"))
            .and(header("Access-Token", "key"))
            .and(body_partial_json(serde_json::json!({
                "type": "note",
                "channel_tag": "trains",
                "title": "2020-01-01 08:00:00 Poissy > Paris Saint-Lazare",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let config = PushbulletConfig {
            api_key: "key".into(),
            channel: "trains".into(),
            base_url: Some(server.uri()),
        };
        let notifier = PushbulletNotifier::new(&config, stations()).unwrap();
        notifier.send(&record(), true).await.unwrap();
    }

    #[tokio::test]
    async fn test_pushbullet_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .mount(&server)
            .await;

        let config = PushbulletConfig {
            api_key: "bad".into(),
            channel: "trains".into(),
            base_url: Some(server.uri()),
        };
        let notifier = PushbulletNotifier::new(&config, stations()).unwrap();
        let err = notifier.send(&record(), true).await.unwrap_err();
        assert!(matches!(err, NotificationError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_fan_out_continues_after_failure() {
        let failing = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let ok = Arc::new(RecordingSink::default());
        let mut notifiers = Notifiers::default();
        notifiers.push(failing.clone());
        notifiers.push(ok.clone());

        assert!(notifiers.send(&record(), false).await.is_err());
        assert_eq!(failing.calls.lock().unwrap().len(), 1);
        assert_eq!(
            *ok.calls.lock().unwrap(),
            vec![("148614".to_string(), false)]
        );
    }

    #[test]
    fn test_from_config() {
        let config = NotificationConfig {
            log: true,
            pushbullet: Some(PushbulletConfig {
                api_key: "key".into(),
                channel: "trains".into(),
                base_url: None,
            }),
        };
        assert_eq!(Notifiers::from_config(&config, &stations()).unwrap().len(), 2);
        let config = NotificationConfig {
            log: false,
            pushbullet: None,
        };
        assert_eq!(Notifiers::from_config(&config, &stations()).unwrap().len(), 0);
    }
}
