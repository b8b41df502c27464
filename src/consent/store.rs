//! In-memory consent store with change notifications.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};

use super::types::{ConsentChange, ConsentChangeKind, ConsentRecord, ConsentUpdate};
use crate::clock::{Clock, SystemClock};
use crate::error::ConsentError;

/// Capacity of the change channel. Slow subscribers see `Lagged`.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Holds one consent record per user.
///
/// Thread-safe via `RwLock`; share it behind an `Arc`.
pub struct ConsentStore {
    records: Arc<RwLock<HashMap<String, ConsentRecord>>>,
    changes: broadcast::Sender<ConsentChange>,
    clock: Arc<dyn Clock>,
}

impl ConsentStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            changes,
            clock,
        }
    }

    /// Store a record for the user, replacing any prior one.
    ///
    /// The stored timestamp is always the current time.
    pub async fn grant(&self, user_id: &str, mut record: ConsentRecord) -> ConsentRecord {
        record.timestamp = self.clock.now();
        self.records
            .write()
            .await
            .insert(user_id.to_string(), record.clone());

        tracing::info!(
            user_id,
            follow_up = record.follow_up_consent,
            "Consent granted"
        );
        self.publish(user_id, ConsentChangeKind::Granted, Some(record.clone()));
        record
    }

    /// Remove the user's record. Unconditional.
    ///
    /// Returns the previous record, if one existed.
    pub async fn revoke(&self, user_id: &str) -> Option<ConsentRecord> {
        let previous = self.records.write().await.remove(user_id);
        if previous.is_some() {
            tracing::info!(user_id, "Consent revoked");
        } else {
            tracing::debug!(user_id, "Consent revoke for user without a record");
        }
        self.publish(user_id, ConsentChangeKind::Revoked, None);
        previous
    }

    /// Apply a partial update and refresh the timestamp.
    pub async fn update(
        &self,
        user_id: &str,
        update: ConsentUpdate,
    ) -> Result<ConsentRecord, ConsentError> {
        let updated = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(user_id)
                .ok_or_else(|| ConsentError::NotFound {
                    user_id: user_id.to_string(),
                })?;
            update.apply(record);
            record.timestamp = self.clock.now();
            record.clone()
        };

        tracing::debug!(user_id, "Consent updated");
        self.publish(user_id, ConsentChangeKind::Updated, Some(updated.clone()));
        Ok(updated)
    }

    pub async fn get(&self, user_id: &str) -> Option<ConsentRecord> {
        self.records.read().await.get(user_id).cloned()
    }

    /// Whether any consent record exists for the user.
    pub async fn has_consent(&self, user_id: &str) -> bool {
        self.records.read().await.contains_key(user_id)
    }

    /// Whether the user currently allows follow-up contact.
    pub async fn follow_up_allowed(&self, user_id: &str) -> bool {
        self.records
            .read()
            .await
            .get(user_id)
            .is_some_and(|r| r.follow_up_consent)
    }

    /// Subscribe to consent changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsentChange> {
        self.changes.subscribe()
    }

    fn publish(&self, user_id: &str, kind: ConsentChangeKind, record: Option<ConsentRecord>) {
        // No subscribers is fine.
        let _ = self.changes.send(ConsentChange {
            user_id: user_id.to_string(),
            kind,
            record,
        });
    }
}

impl Default for ConsentStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}
