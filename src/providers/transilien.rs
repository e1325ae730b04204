//! Transilien live departures API.
//!
//! `GET {base}/gare/{from}/depart/{to}/` (HTTP basic auth) lists the next
//! trains leaving `from` that stop at `to`:
//!
//! ```xml
//! <passages gare="87393009">
//!   <train>
//!     <date mode="R">23/05/2012 12:14</date>
//!     <num>148614</num>
//!     <miss>VICK</miss>
//!     <term>87393157</term>
//!     <etat>S</etat>
//!   </train>
//! </passages>
//! ```
//!
//! `etat` is only present when the train is not running normally.
//! No retries here; the next poll cycle is the retry.

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, error, info};

use crate::config::FeedConfig;
use crate::models::Observation;
use crate::time_codec::{self, TimeError};

#[derive(Debug, Clone)]
pub struct TransilienClient {
    client: reqwest::Client,
    base_url: String,
    login: String,
    password: String,
}

/// One `<train>` element, fields as reported
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedTrain {
    pub date: String,
    pub num: String,
    pub miss: Option<String>,
    pub term: Option<String>,
    pub etat: Option<String>,
}

impl FeedTrain {
    pub fn into_observation(self, from_station: &str, to_station: &str) -> Result<Observation, TimeError> {
        let time = time_codec::parse_feed_time(&self.date)?;
        let terminus_code = self.term.as_deref().and_then(|t| t.trim().parse().ok());

        Ok(Observation {
            train_number: self.num,
            mission_code: self.miss.unwrap_or_default(),
            terminus_code,
            time,
            raw_status: self.etat.filter(|e| !e.is_empty()),
            from_station: from_station.to_string(),
            to_station: to_station.to_string(),
        })
    }
}

impl TransilienClient {
    pub fn new(config: &FeedConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| FeedError::Client(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            login: config.login.clone(),
            password: config.password.clone(),
        })
    }

    /// Fetch the trains currently reported from `from` towards `to`, in feed order
    pub async fn fetch_departures(&self, from: &str, to: &str) -> Result<Vec<FeedTrain>, FeedError> {
        let url = format!(
            "{}/gare/{}/depart/{}/",
            self.base_url,
            urlencoding::encode(from),
            urlencoding::encode(to)
        );

        debug!(url = %url, "Fetching departures");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.login, Some(&self.password))
            .send()
            .await
            .map_err(|e| FeedError::Transport {
                from: from.to_string(),
                to: to.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| FeedError::Transport {
            from: from.to_string(),
            to: to.to_string(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(FeedError::Status {
                from: from.to_string(),
                to: to.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        let trains = parse_passages(&text).map_err(|message| {
            error!(
                error = %message,
                body_preview = %text.chars().take(500).collect::<String>(),
                "Failed to parse Transilien response"
            );
            FeedError::Parse {
                from: from.to_string(),
                to: to.to_string(),
                message,
            }
        })?;

        info!(from = %from, to = %to, trains = trains.len(), "Retrieved departures");
        Ok(trains)
    }
}

/// Parse a `<passages>` document into its trains, in document order
pub fn parse_passages(xml: &str) -> Result<Vec<FeedTrain>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut trains = Vec::new();
    let mut buf = Vec::new();

    let mut current: Option<FeedTrain> = None;
    let mut current_tag = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == "train" {
                    current = Some(FeedTrain::default());
                    current_tag.clear();
                } else {
                    current_tag = name;
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == "train" {
                    if let Some(train) = current.take() {
                        if train.num.is_empty() || train.date.is_empty() {
                            return Err(format!("train element missing num or date: {train:?}"));
                        }
                        trains.push(train);
                    }
                }
                current_tag.clear();
            }
            Ok(Event::Text(e)) => {
                if let Some(train) = current.as_mut() {
                    let text = e
                        .unescape()
                        .map_err(|e| format!("XML parse error: {e}"))?
                        .trim()
                        .to_string();
                    match current_tag.as_str() {
                        "date" => train.date = text,
                        "num" => train.num = text,
                        "miss" => train.miss = Some(text),
                        "term" => train.term = Some(text),
                        "etat" => train.etat = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("XML parse error: {e}")),
            _ => {}
        }
        buf.clear();
    }

    if current.is_some() {
        return Err("unterminated train element".to_string());
    }

    Ok(trains)
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Feed client error: {0}")]
    Client(String),
    #[error("Feed request for {from} to {to} failed: {message}")]
    Transport {
        from: String,
        to: String,
        message: String,
    },
    #[error("Feed for {from} to {to} returned status {status}: {body}")]
    Status {
        from: String,
        to: String,
        status: u16,
        body: String,
    },
    #[error("Feed for {from} to {to} could not be parsed: {message}")]
    Parse {
        from: String,
        to: String,
        message: String,
    },
}
