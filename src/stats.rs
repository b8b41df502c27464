//! Rolling outcome statistics over ended sessions.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::session::{EndReason, Session};

/// Point-in-time aggregate over the recorded window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Ended sessions in the window.
    pub total_sessions: u64,
    /// Sessions that reached a counselor at least once.
    pub successful_connections: u64,
    pub average_session_duration_secs: f64,
    /// `successful_connections / max(total_sessions, 1)`.
    pub success_rate: f64,
    pub ended_by_reason: HashMap<EndReason, u64>,
    /// Sessions that needed the fallback channel.
    pub fallback_sessions: u64,
}

#[derive(Debug, Clone)]
struct Outcome {
    connected: bool,
    duration_secs: f64,
    reason: EndReason,
    fallback_used: bool,
}

/// Keeps the most recent ended sessions and derives [`Statistics`] from them.
pub struct StatisticsAggregator {
    window: usize,
    history: RwLock<VecDeque<Outcome>>,
}

impl StatisticsAggregator {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            history: RwLock::new(VecDeque::with_capacity(window.min(1024))),
        }
    }

    /// Record an ended session. Live sessions are ignored.
    ///
    /// Returns whether the session was recorded.
    pub async fn record(&self, session: &Session) -> bool {
        let Some(reason) = session.end_reason() else {
            tracing::debug!(session_id = %session.id, "Ignoring live session in statistics");
            return false;
        };

        let duration_secs = session
            .duration()
            .map(|d| d.num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);

        let mut history = self.history.write().await;
        if history.len() == self.window {
            history.pop_front();
        }
        history.push_back(Outcome {
            connected: session.was_connected(),
            duration_secs,
            reason,
            fallback_used: session.fallback_used,
        });
        true
    }

    /// Recompute statistics from the window.
    pub async fn snapshot(&self) -> Statistics {
        let history = self.history.read().await;

        let total = history.len() as u64;
        let successful = history.iter().filter(|o| o.connected).count() as u64;
        let fallback_sessions = history.iter().filter(|o| o.fallback_used).count() as u64;
        let duration_sum: f64 = history.iter().map(|o| o.duration_secs).sum();

        let mut ended_by_reason = HashMap::new();
        for outcome in history.iter() {
            *ended_by_reason.entry(outcome.reason).or_insert(0) += 1;
        }

        Statistics {
            total_sessions: total,
            successful_connections: successful,
            average_session_duration_secs: if total > 0 {
                duration_sum / total as f64
            } else {
                0.0
            },
            success_rate: successful as f64 / total.max(1) as f64,
            ended_by_reason,
            fallback_sessions,
        }
    }

    /// Maximum number of sessions kept.
    pub fn window(&self) -> usize {
        self.window
    }
}
