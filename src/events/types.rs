//! Event names and payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::followup::FollowUpTask;
use crate::session::{Session, Severity};

/// Named events published by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// The orchestrator finished construction.
    #[serde(rename = "initialized")]
    Initialized,
    /// A crisis connection was established.
    #[serde(rename = "988-connected")]
    Connected,
    /// A session changed state or data.
    #[serde(rename = "session-updated")]
    SessionUpdated,
    /// A session reached `ended`. Emitted exactly once per session.
    #[serde(rename = "session-ended")]
    SessionEnded,
    /// A connection was requested for a user without consent.
    #[serde(rename = "consent-required")]
    ConsentRequired,
    /// Sampled quality dropped below the poor threshold.
    #[serde(rename = "connection-quality-poor")]
    ConnectionQualityPoor,
    /// The session was handed to another counselor.
    #[serde(rename = "warm-handoff")]
    WarmHandoff,
    /// A fired follow-up was acknowledged.
    #[serde(rename = "followup-completed")]
    FollowUpCompleted,
    /// A follow-up task fired.
    #[serde(rename = "welfare-check")]
    WelfareCheck,
    /// Primary and fallback dials both failed.
    #[serde(rename = "fallback-failed")]
    FallbackFailed,
    /// A quality sample was taken.
    #[serde(rename = "monitoring-update")]
    MonitoringUpdate,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 11] = [
        EventKind::Initialized,
        EventKind::Connected,
        EventKind::SessionUpdated,
        EventKind::SessionEnded,
        EventKind::ConsentRequired,
        EventKind::ConnectionQualityPoor,
        EventKind::WarmHandoff,
        EventKind::FollowUpCompleted,
        EventKind::WelfareCheck,
        EventKind::FallbackFailed,
        EventKind::MonitoringUpdate,
    ];

    /// The wire name of this event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Connected => "988-connected",
            Self::SessionUpdated => "session-updated",
            Self::SessionEnded => "session-ended",
            Self::ConsentRequired => "consent-required",
            Self::ConnectionQualityPoor => "connection-quality-poor",
            Self::WarmHandoff => "warm-handoff",
            Self::FollowUpCompleted => "followup-completed",
            Self::WelfareCheck => "welfare-check",
            Self::FallbackFailed => "fallback-failed",
            Self::MonitoringUpdate => "monitoring-update",
        }
    }

    /// Look up a kind by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed data carried by an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Initialized {
        gateway: String,
        auto_connect: bool,
    },
    Session {
        session: Session,
    },
    ConsentRequired {
        user_id: String,
        crisis_event_id: Uuid,
        severity: Severity,
    },
    QualityPoor {
        session: Session,
        quality: f64,
        consecutive_poor: u32,
    },
    Handoff {
        session: Session,
        previous_counselor: Option<String>,
        specialization: String,
    },
    FollowUp {
        task: FollowUpTask,
    },
    FallbackFailed {
        session: Session,
        attempts: u32,
        reason: String,
    },
}

impl EventPayload {
    /// The session snapshot carried by this payload, if any.
    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::Session { session }
            | Self::QualityPoor { session, .. }
            | Self::Handoff { session, .. }
            | Self::FallbackFailed { session, .. } => Some(session),
            _ => None,
        }
    }

    /// The follow-up task carried by this payload, if any.
    pub fn task(&self) -> Option<&FollowUpTask> {
        match self {
            Self::FollowUp { task } => Some(task),
            _ => None,
        }
    }
}

/// An emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrisisNotification {
    pub kind: EventKind,
    pub payload: EventPayload,
    pub emitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(EventKind::Connected.to_string(), "988-connected");
        assert_eq!(EventKind::FollowUpCompleted.to_string(), "followup-completed");
        assert_eq!(
            serde_json::to_value(EventKind::ConnectionQualityPoor).unwrap(),
            "connection-quality-poor"
        );
    }

    #[test]
    fn test_event_kind_from_name_covers_all() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_name("988-disconnected"), None);
    }
}
