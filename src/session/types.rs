//! Crisis and session data types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::gateway::ChannelKind;

/// Ordinal crisis risk level produced by the external risk assessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    Imminent,
}

impl Severity {
    /// Severities that warrant connecting without waiting for the user.
    pub fn is_acute(&self) -> bool {
        matches!(self, Self::Critical | Self::Imminent)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
            Self::Imminent => write!(f, "imminent"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            "imminent" => Ok(Self::Imminent),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Assessed crisis signal. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisEvent {
    pub id: Uuid,
    pub user_id: String,
    pub severity: Severity,
    /// What produced the signal (e.g. "journal", "chat", "panic-button").
    pub trigger_source: String,
    pub timestamp: DateTime<Utc>,
    pub risk_factors: Vec<String>,
    pub protective_factors: Vec<String>,
}

impl CrisisEvent {
    pub fn new(user_id: impl Into<String>, severity: Severity, trigger_source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            severity,
            trigger_source: trigger_source.into(),
            timestamp: Utc::now(),
            risk_factors: Vec::new(),
            protective_factors: Vec::new(),
        }
    }

    pub fn with_risk_factors(mut self, factors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.risk_factors = factors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_protective_factors(
        mut self,
        factors: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.protective_factors = factors.into_iter().map(Into::into).collect();
        self
    }
}

/// A recent mood check-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodSample {
    /// 1 (worst) to 10 (best).
    pub score: u8,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuicidalIdeation {
    pub present: bool,
    pub plan: bool,
    pub means: bool,
}

/// Situational snapshot supplied by the caller with each connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrisisContext {
    pub recent_moods: Vec<MoodSample>,
    pub support_available: bool,
    pub suicidal_ideation: SuicidalIdeation,
    pub prior_attempts: u32,
    pub location_safe: bool,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    UserInitiated,
    Timeout,
    FallbackFailed,
    ConsentWithdrawn,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserInitiated => write!(f, "user-initiated"),
            Self::Timeout => write!(f, "timeout"),
            Self::FallbackFailed => write!(f, "fallback-failed"),
            Self::ConsentWithdrawn => write!(f, "consent-withdrawn"),
        }
    }
}

impl FromStr for EndReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user-initiated" | "user" => Ok(Self::UserInitiated),
            "timeout" => Ok(Self::Timeout),
            "fallback-failed" => Ok(Self::FallbackFailed),
            "consent-withdrawn" => Ok(Self::ConsentWithdrawn),
            other => Err(format!("unknown end reason '{}'", other)),
        }
    }
}

/// Session lifecycle state.
///
/// ```text
/// pending --> connecting --> connected <--> degraded
///                 |  ^           |              |
///                 +--+ fallback  v              v
///                 +----------> ended(reason) <--+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Connecting,
    Connected,
    Degraded,
    Ended(EndReason),
}

impl SessionState {
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended(_))
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        match self {
            Self::Ended(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Connecting)
                | (Pending, Ended(_))
                | (Connecting, Connecting)
                | (Connecting, Connected)
                | (Connecting, Ended(_))
                | (Connected, Degraded)
                | (Connected, Ended(_))
                | (Degraded, Connected)
                | (Degraded, Ended(_))
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Degraded => write!(f, "degraded"),
            Self::Ended(reason) => write!(f, "ended({})", reason),
        }
    }
}

/// Kinds of actions recorded on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterventionKind {
    Dial,
    Fallback,
    Reconnect,
    Message,
    Transfer,
    QualityDrop,
}

/// One entry in a session's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub kind: InterventionKind,
    pub note: String,
    pub at: DateTime<Utc>,
}

/// A crisis connection and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub crisis_event_id: Uuid,
    pub severity: Severity,
    pub state: SessionState,
    pub channel: ChannelKind,
    /// Last sampled quality (0.0 to 1.0).
    pub connection_quality: f64,
    pub counselor_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub interventions: Vec<Intervention>,
    pub dial_attempts: u32,
    pub fallback_used: bool,
    pub reconnect_attempted: bool,
}

impl Session {
    pub(crate) fn new(event: &CrisisEvent, channel: ChannelKind, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: event.user_id.clone(),
            crisis_event_id: event.id,
            severity: event.severity,
            state: SessionState::Pending,
            channel,
            connection_quality: 0.0,
            counselor_ref: None,
            started_at: now,
            connected_at: None,
            ended_at: None,
            interventions: Vec::new(),
            dial_attempts: 0,
            fallback_used: false,
            reconnect_attempted: false,
        }
    }

    /// Move to `next`, stamping connect and end times.
    pub(crate) fn transition(
        &mut self,
        next: SessionState,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        if !self.state.can_transition_to(&next) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        if next == SessionState::Connected && self.connected_at.is_none() {
            self.connected_at = Some(now);
        }
        if next.is_ended() {
            self.ended_at = Some(now);
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn record(&mut self, kind: InterventionKind, note: impl Into<String>, now: DateTime<Utc>) {
        self.interventions.push(Intervention {
            kind,
            note: note.into(),
            at: now,
        });
    }

    /// Whether the session is anything but ended.
    pub fn is_live(&self) -> bool {
        !self.state.is_ended()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.state.end_reason()
    }

    /// Whether a counselor connection was ever established.
    pub fn was_connected(&self) -> bool {
        self.connected_at.is_some()
    }

    /// Time from start to end; `None` while live.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}
