//! Merges each fresh observation into stored state.
//!
//! A train number is only unique within a service day, so a sighting is
//! matched against the latest record for that number inside the dedup
//! window. What happens next is decided by [`decide`], a pure function over
//! the existing record and the candidate built from the observation:
//!
//! 1. no existing record: insert (notify if it is already cancelled)
//! 2. newly cancelled: mark SUPPR and notify
//! 3. time changed: mark RETARD and store the delay
//! 4. status changed at the same time: store it, notify if un-cancelled
//! 5. otherwise nothing
//!
//! Only the first matching rule applies, so a cancelled train re-reported
//! with a later time becomes a delay rather than a reinstatement.

use chrono::{Duration, NaiveDateTime};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{NewRecord, NotificationIntent, Observation, Record, RecordUpdate, Status};
use crate::notifications::NotificationSink;
use crate::store::{ObservationStore, StoreError};
use crate::time_codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inserted,
    Cancelled,
    Delayed,
    StatusChanged,
    Unchanged,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Inserted => "inserted",
            Outcome::Cancelled => "cancelled",
            Outcome::Delayed => "delayed",
            Outcome::StatusChanged => "status_changed",
            Outcome::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub outcome: Outcome,
    /// Fields to write on the existing record; `None` for inserts and no-ops
    pub update: Option<RecordUpdate>,
    pub notification: Option<NotificationIntent>,
}

impl Decision {
    fn unchanged() -> Self {
        Self {
            outcome: Outcome::Unchanged,
            update: None,
            notification: None,
        }
    }
}

pub fn decide(existing: Option<&Record>, candidate: &NewRecord) -> Decision {
    let Some(existing) = existing else {
        return Decision {
            outcome: Outcome::Inserted,
            update: None,
            notification: (candidate.status == Status::Suppr)
                .then_some(NotificationIntent::NewCancellation),
        };
    };

    if candidate.status != existing.status && candidate.status == Status::Suppr {
        return Decision {
            outcome: Outcome::Cancelled,
            update: Some(RecordUpdate {
                status: Some(Status::Suppr),
                raw_status: Some(candidate.raw_status.clone()),
                delay_seconds: None,
            }),
            notification: Some(NotificationIntent::NewCancellation),
        };
    }

    if candidate.date != existing.date {
        return Decision {
            outcome: Outcome::Delayed,
            update: Some(RecordUpdate {
                status: Some(Status::Retard),
                raw_status: Some(candidate.raw_status.clone()),
                delay_seconds: Some(delay_seconds(existing, candidate)),
            }),
            notification: None,
        };
    }

    if candidate.status != existing.status {
        return Decision {
            outcome: Outcome::StatusChanged,
            update: Some(RecordUpdate {
                status: Some(candidate.status.clone()),
                raw_status: Some(candidate.raw_status.clone()),
                delay_seconds: None,
            }),
            notification: (existing.status == Status::Suppr)
                .then_some(NotificationIntent::Reinstatement),
        };
    }

    Decision::unchanged()
}

/// Seconds between the first sighting and this one. An earlier time means
/// the feed was read out of order; it is stored as no delay.
fn delay_seconds(existing: &Record, candidate: &NewRecord) -> i64 {
    let delta = candidate.date.signed_duration_since(existing.date).num_seconds();
    if delta < 0 {
        warn!(
            train = %candidate.train_number,
            stored = %time_codec::to_canonical(&existing.date),
            reported = %time_codec::to_canonical(&candidate.date),
            "Train re-reported earlier than first sighting, clamping delay to 0"
        );
        0
    } else {
        delta
    }
}

/// Result of reconciling one observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub record: Record,
    pub outcome: Outcome,
    pub notification: Option<NotificationIntent>,
}

pub struct Reconciler {
    store: ObservationStore,
    notifier: Arc<dyn NotificationSink>,
    dedup_window: Duration,
}

impl Reconciler {
    pub fn new(
        store: ObservationStore,
        notifier: Arc<dyn NotificationSink>,
        dedup_window: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            dedup_window,
        }
    }

    pub async fn reconcile(&self, observation: &Observation) -> Result<Reconciliation, ReconcileError> {
        self.reconcile_at(observation, time_codec::now()).await
    }

    /// Reconcile as if the current time were `now`
    pub async fn reconcile_at(
        &self,
        observation: &Observation,
        now: NaiveDateTime,
    ) -> Result<Reconciliation, ReconcileError> {
        let candidate = NewRecord::from_observation(observation);
        let window_start = time_codec::dedup_window_start(now, self.dedup_window);

        let (record, decision) = {
            let _guard = self.store.lock_writes().await;

            let existing = self
                .store
                .find_active(&candidate.train_number, window_start)
                .await?;
            let decision = decide(existing.as_ref(), &candidate);

            let record = match (existing, &decision.update) {
                (None, _) => self.store.insert(candidate).await?,
                (Some(mut existing), Some(update)) => {
                    self.store.update_fields(existing.id, update).await?;
                    update.apply_to(&mut existing);
                    existing
                }
                (Some(existing), None) => existing,
            };
            (record, decision)
        };

        if decision.outcome == Outcome::Unchanged {
            debug!(train = %record.train_number, id = record.id, "Train unchanged");
        } else {
            info!(
                train = %record.train_number,
                id = record.id,
                outcome = decision.outcome.as_str(),
                status = %record.status,
                delay_seconds = ?record.delay_seconds,
                "Reconciled train"
            );
        }

        if let Some(intent) = decision.notification {
            // The write above stands whatever happens here
            if let Err(e) = self.notifier.send(&record, intent.cancelled()).await {
                warn!(
                    train = %record.train_number,
                    id = record.id,
                    ?intent,
                    error = %e,
                    "Failed to send notification"
                );
            }
        }

        Ok(Reconciliation {
            record,
            outcome: decision.outcome,
            notification: decision.notification,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
}
