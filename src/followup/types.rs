//! Follow-up task types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of post-crisis contact a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FollowUpType {
    CheckIn,
    WelfareCheck,
    SafetyPlanReview,
}

impl fmt::Display for FollowUpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckIn => write!(f, "check-in"),
            Self::WelfareCheck => write!(f, "welfare-check"),
            Self::SafetyPlanReview => write!(f, "safety-plan-review"),
        }
    }
}

/// Lifecycle of a follow-up task.
///
/// ```text
/// pending --timer--> fired --acknowledge--> completed
///    |                 |
///    +----cancel-------+--> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStatus {
    Pending,
    Fired,
    Completed,
    Cancelled,
}

impl fmt::Display for FollowUpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Fired => write!(f, "fired"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A scheduled post-crisis welfare check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: String,
    pub scheduled_time: DateTime<Utc>,
    /// 1 for the first follow-up of a session, then 2, 3, ...
    pub attempt_number: u32,
    pub task_type: FollowUpType,
    pub status: FollowUpStatus,
}

impl FollowUpTask {
    /// Whether the task is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == FollowUpStatus::Pending && self.scheduled_time <= now
    }
}
