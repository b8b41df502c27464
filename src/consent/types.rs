//! Consent data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The permissions a user grants before automated intervention.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
    /// Share crisis context with the answering counselor.
    pub data_sharing: bool,
    /// Allow the session to be recorded.
    pub recording_consent: bool,
    /// Notify the user's emergency contact.
    pub emergency_contact_notification: bool,
    /// Allow post-crisis welfare checks.
    pub follow_up_consent: bool,
    /// When the record was last granted or updated.
    pub timestamp: DateTime<Utc>,
    /// Whether the user may withdraw through the UI.
    pub withdrawable: bool,
}

impl ConsentRecord {
    /// A record granting every permission.
    pub fn granting_all() -> Self {
        Self {
            data_sharing: true,
            recording_consent: true,
            emergency_contact_notification: true,
            follow_up_consent: true,
            timestamp: Utc::now(),
            withdrawable: true,
        }
    }

    /// Builder: set follow-up consent.
    pub fn with_follow_up(mut self, allowed: bool) -> Self {
        self.follow_up_consent = allowed;
        self
    }
}

/// Partial consent update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentUpdate {
    pub data_sharing: Option<bool>,
    pub recording_consent: Option<bool>,
    pub emergency_contact_notification: Option<bool>,
    pub follow_up_consent: Option<bool>,
    pub withdrawable: Option<bool>,
}

impl ConsentUpdate {
    pub(super) fn apply(&self, record: &mut ConsentRecord) {
        if let Some(v) = self.data_sharing {
            record.data_sharing = v;
        }
        if let Some(v) = self.recording_consent {
            record.recording_consent = v;
        }
        if let Some(v) = self.emergency_contact_notification {
            record.emergency_contact_notification = v;
        }
        if let Some(v) = self.follow_up_consent {
            record.follow_up_consent = v;
        }
        if let Some(v) = self.withdrawable {
            record.withdrawable = v;
        }
    }
}

/// What happened to a user's consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentChangeKind {
    Granted,
    Updated,
    Revoked,
}

/// Notification published on every consent mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentChange {
    pub user_id: String,
    pub kind: ConsentChangeKind,
    /// The record after the change; `None` once revoked.
    pub record: Option<ConsentRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_touches_only_present_fields() {
        let mut record = ConsentRecord::granting_all();
        let update = ConsentUpdate {
            follow_up_consent: Some(false),
            ..ConsentUpdate::default()
        };
        update.apply(&mut record);

        assert!(!record.follow_up_consent);
        assert!(record.data_sharing);
        assert!(record.recording_consent);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let json = serde_json::to_value(ConsentRecord::granting_all()).unwrap();
        assert_eq!(json["followUpConsent"], true);
        assert_eq!(json["emergencyContactNotification"], true);
    }
}
