use std::sync::Arc;
use tracing::{error, info, warn};

use crate::providers::transilien::{FeedError, FeedTrain, TransilienClient};
use crate::reconciler::{Outcome, Reconciler};

/// Counters for one direction of one poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Trains dropped before reconciliation (malformed time)
    pub skipped: usize,
    /// Trains whose reconciliation failed in storage
    pub failed: usize,
    pub notifications: usize,
}

#[derive(Debug)]
pub struct DirectionReport {
    pub from: String,
    pub to: String,
    pub result: Result<DirectionSummary, FeedError>,
}

#[derive(Debug, Default)]
pub struct PollSummary {
    pub directions: Vec<DirectionReport>,
}

impl PollSummary {
    /// `from > to` for each direction whose fetch failed
    pub fn failed_directions(&self) -> Vec<String> {
        self.directions
            .iter()
            .filter(|d| d.result.is_err())
            .map(|d| format!("{} > {}", d.from, d.to))
            .collect()
    }
}

/// Polls both directions of the route and feeds every train to the reconciler
pub struct PollManager {
    feed: TransilienClient,
    reconciler: Reconciler,
    from_station: String,
    to_station: String,
}

impl PollManager {
    pub fn new(
        feed: TransilienClient,
        reconciler: Reconciler,
        from_station: String,
        to_station: String,
    ) -> Self {
        Self {
            feed,
            reconciler,
            from_station,
            to_station,
        }
    }

    /// Run `poll_once` forever on a fixed interval
    pub async fn start(self: Arc<Self>, interval: std::time::Duration) {
        info!(interval_secs = interval.as_secs(), "Starting poll loop");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }

    /// One poll cycle: outbound then inbound. A failed direction does not stop the other.
    pub async fn poll_once(&self) -> PollSummary {
        let mut summary = PollSummary::default();

        for (from, to) in [
            (&self.from_station, &self.to_station),
            (&self.to_station, &self.from_station),
        ] {
            let result = self.poll_direction(from, to).await;
            match &result {
                Ok(counts) => info!(
                    from = %from,
                    to = %to,
                    inserted = counts.inserted,
                    updated = counts.updated,
                    unchanged = counts.unchanged,
                    skipped = counts.skipped,
                    failed = counts.failed,
                    notifications = counts.notifications,
                    "Completed direction"
                ),
                Err(e) => error!(from = %from, to = %to, error = %e, "Feed fetch failed"),
            }
            summary.directions.push(DirectionReport {
                from: from.clone(),
                to: to.clone(),
                result,
            });
        }

        summary
    }

    async fn poll_direction(&self, from: &str, to: &str) -> Result<DirectionSummary, FeedError> {
        let trains = self.feed.fetch_departures(from, to).await?;
        Ok(self.process_trains(trains, from, to).await)
    }

    /// Reconcile trains strictly in feed order; one bad train never stops the batch
    pub async fn process_trains(&self, trains: Vec<FeedTrain>, from: &str, to: &str) -> DirectionSummary {
        let mut counts = DirectionSummary::default();

        for train in trains {
            let num = train.num.clone();
            let observation = match train.into_observation(from, to) {
                Ok(observation) => observation,
                Err(e) => {
                    warn!(train = %num, error = %e, "Skipping train with malformed time");
                    counts.skipped += 1;
                    continue;
                }
            };

            match self.reconciler.reconcile(&observation).await {
                Ok(result) => {
                    match result.outcome {
                        Outcome::Inserted => counts.inserted += 1,
                        Outcome::Unchanged => counts.unchanged += 1,
                        Outcome::Cancelled | Outcome::Delayed | Outcome::StatusChanged => {
                            counts.updated += 1
                        }
                    }
                    if result.notification.is_some() {
                        counts.notifications += 1;
                    }
                }
                Err(e) => {
                    error!(train = %num, error = %e, "Failed to reconcile train");
                    counts.failed += 1;
                }
            }
        }

        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Status;
    use crate::notifications::tests::RecordingSink;
    use crate::providers::transilien::tests::{feed_config, PASSAGES};
    use crate::store::tests::memory_store;
    use crate::store::ObservationStore;
    use crate::time_codec;
    use chrono::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn manager(base_url: &str) -> (PollManager, ObservationStore, Arc<RecordingSink>) {
        let store = memory_store().await;
        let sink = Arc::new(RecordingSink::default());
        let reconciler = Reconciler::new(store.clone(), sink.clone(), Duration::hours(4));
        let feed = TransilienClient::new(&feed_config(base_url)).unwrap();
        let manager = PollManager::new(feed, reconciler, "87393009".into(), "87384008".into());
        (manager, store, sink)
    }

    /// The fixture with every train due a few minutes ago, inside the dedup window
    fn recent_passages() -> String {
        let date = (time_codec::now() - Duration::minutes(5))
            .format("%d/%m/%Y %H:%M")
            .to_string();
        ["23/05/2012 12:14", "23/05/2012 12:44", "23/05/2012 13:14"]
            .iter()
            .fold(PASSAGES.to_string(), |xml, old| xml.replace(old, &date))
    }

    #[tokio::test]
    async fn test_poll_once_processes_both_directions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gare/87393009/depart/87384008/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PASSAGES))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gare/87384008/depart/87393009/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<passages gare=\"87384008\"/>"))
            .mount(&server)
            .await;

        let (manager, store, sink) = manager(&server.uri()).await;
        let summary = manager.poll_once().await;

        assert_eq!(summary.directions.len(), 2);
        assert!(summary.failed_directions().is_empty());
        let outbound = summary.directions[0].result.as_ref().unwrap();
        assert_eq!(outbound.inserted, 3);
        assert_eq!(outbound.notifications, 1);
        let inbound = summary.directions[1].result.as_ref().unwrap();
        assert_eq!(*inbound, DirectionSummary::default());

        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(*sink.calls.lock().unwrap(), vec![("148614".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_failed_direction_does_not_stop_the_other() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gare/87393009/depart/87384008/"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gare/87384008/depart/87393009/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PASSAGES))
            .mount(&server)
            .await;

        let (manager, store, _sink) = manager(&server.uri()).await;
        let summary = manager.poll_once().await;

        assert_eq!(summary.failed_directions(), vec!["87393009 > 87384008"]);
        assert!(matches!(
            summary.directions[0].result,
            Err(FeedError::Status { status: 500, .. })
        ));
        assert_eq!(summary.directions[1].result.as_ref().unwrap().inserted, 3);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_malformed_time_skips_only_that_train() {
        let (manager, store, _sink) = manager("http://127.0.0.1:9").await;
        let trains = vec![
            FeedTrain {
                date: "not a date".into(),
                num: "1".into(),
                ..Default::default()
            },
            FeedTrain {
                date: "23/05/2012 12:14".into(),
                num: "2".into(),
                etat: Some("Retardé".into()),
                ..Default::default()
            },
        ];

        let counts = manager.process_trains(trains, "A", "B").await;
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.inserted, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(1).await.unwrap().status, Status::Retard);
    }

    #[tokio::test]
    async fn test_storage_failure_counts_and_continues() {
        let (manager, store, _sink) = manager("http://127.0.0.1:9").await;
        store.pool().close().await;
        let trains = vec![
            FeedTrain {
                date: "23/05/2012 12:14".into(),
                num: "1".into(),
                ..Default::default()
            },
            FeedTrain {
                date: "23/05/2012 12:44".into(),
                num: "2".into(),
                ..Default::default()
            },
        ];

        let counts = manager.process_trains(trains, "A", "B").await;
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.inserted, 0);
    }

    #[tokio::test]
    async fn test_repeated_poll_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gare/87393009/depart/87384008/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(recent_passages()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gare/87384008/depart/87393009/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<passages/>"))
            .mount(&server)
            .await;

        let (manager, store, sink) = manager(&server.uri()).await;
        manager.poll_once().await;
        let second = manager.poll_once().await;

        let outbound = second.directions[0].result.as_ref().unwrap();
        assert_eq!(outbound.unchanged, 3);
        assert_eq!(outbound.inserted, 0);
        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
    }
}
