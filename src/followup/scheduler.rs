//! Timer-driven follow-up scheduling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::types::{FollowUpStatus, FollowUpTask, FollowUpType};
use crate::clock::Clock;
use crate::consent::ConsentStore;
use crate::error::FollowUpError;
use crate::events::{EventBus, EventKind, EventPayload};

struct Entry {
    task: FollowUpTask,
    timer: CancellationToken,
}

#[derive(Default)]
struct Table {
    tasks: HashMap<Uuid, Entry>,
    /// Follow-ups scheduled so far, per session.
    attempts: HashMap<Uuid, u32>,
}

/// Schedules welfare checks and fires them when due.
///
/// Each task owns a timer token derived from the scheduler's shutdown token,
/// so cancelling a task or shutting the scheduler down never leaves a timer
/// running.
pub struct FollowUpScheduler {
    table: Arc<RwLock<Table>>,
    consent: Arc<ConsentStore>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl FollowUpScheduler {
    pub fn new(consent: Arc<ConsentStore>, events: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Arc::new(RwLock::new(Table::default())),
            consent,
            events,
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    /// Schedule a follow-up `delay` from now.
    ///
    /// Refused unless the user has a consent record with follow-up allowed.
    pub async fn schedule(
        &self,
        session_id: Uuid,
        user_id: &str,
        task_type: FollowUpType,
        delay: Duration,
    ) -> Result<FollowUpTask, FollowUpError> {
        if !self.consent.follow_up_allowed(user_id).await {
            tracing::debug!(user_id, session_id = %session_id, "Follow-up refused without consent");
            return Err(FollowUpError::ConsentDenied {
                user_id: user_id.to_string(),
            });
        }

        let offset = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let timer = self.shutdown.child_token();

        let task = {
            let mut table = self.table.write().await;
            let attempt = table.attempts.entry(session_id).or_insert(0);
            *attempt += 1;

            let task = FollowUpTask {
                id: Uuid::new_v4(),
                session_id,
                user_id: user_id.to_string(),
                scheduled_time: self.clock.now() + offset,
                attempt_number: *attempt,
                task_type,
                status: FollowUpStatus::Pending,
            };
            table.tasks.insert(
                task.id,
                Entry {
                    task: task.clone(),
                    timer: timer.clone(),
                },
            );
            task
        };

        tracing::info!(
            task_id = %task.id,
            session_id = %session_id,
            user_id,
            task_type = %task_type,
            attempt = task.attempt_number,
            delay_secs = delay.as_secs(),
            "Follow-up scheduled"
        );

        let table = Arc::clone(&self.table);
        let events = Arc::clone(&self.events);
        let task_id = task.id;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    fire(&table, &events, task_id).await;
                }
            }
        });

        Ok(task)
    }

    /// Cancel a pending or fired task and drop it from the table.
    pub async fn cancel(&self, task_id: Uuid) -> Result<FollowUpTask, FollowUpError> {
        let entry = self
            .table
            .write()
            .await
            .tasks
            .remove(&task_id)
            .ok_or(FollowUpError::NotFound { task_id })?;
        entry.timer.cancel();

        let mut task = entry.task;
        task.status = FollowUpStatus::Cancelled;
        tracing::info!(task_id = %task_id, user_id = %task.user_id, "Follow-up cancelled");
        Ok(task)
    }

    /// Mark a fired task completed and drop it from the table.
    pub async fn acknowledge(&self, task_id: Uuid) -> Result<FollowUpTask, FollowUpError> {
        let task = {
            let mut table = self.table.write().await;
            let entry = table
                .tasks
                .get(&task_id)
                .ok_or(FollowUpError::NotFound { task_id })?;
            if entry.task.status != FollowUpStatus::Fired {
                return Err(FollowUpError::InvalidStatus {
                    task_id,
                    status: entry.task.status,
                    operation: "acknowledge",
                });
            }
            let Some(entry) = table.tasks.remove(&task_id) else {
                return Err(FollowUpError::NotFound { task_id });
            };
            entry.timer.cancel();
            let mut task = entry.task;
            task.status = FollowUpStatus::Completed;
            task
        };

        tracing::info!(task_id = %task_id, user_id = %task.user_id, "Follow-up completed");
        self.events.emit(
            EventKind::FollowUpCompleted,
            EventPayload::FollowUp { task: task.clone() },
        );
        Ok(task)
    }

    /// Fire every pending task whose scheduled time has passed.
    pub async fn fire_due(&self) -> Vec<FollowUpTask> {
        let now = self.clock.now();
        let due: Vec<Uuid> = self
            .table
            .read()
            .await
            .tasks
            .values()
            .filter(|e| e.task.is_due(now))
            .map(|e| e.task.id)
            .collect();

        let mut fired = Vec::with_capacity(due.len());
        for task_id in due {
            if let Some(task) = fire(&self.table, &self.events, task_id).await {
                fired.push(task);
            }
        }
        fired
    }

    /// Cancel every task belonging to a user. Returns how many were removed.
    pub async fn cancel_for_user(&self, user_id: &str) -> usize {
        let removed: Vec<Entry> = {
            let mut table = self.table.write().await;
            let ids: Vec<Uuid> = table
                .tasks
                .values()
                .filter(|e| e.task.user_id == user_id)
                .map(|e| e.task.id)
                .collect();
            ids.iter().filter_map(|id| table.tasks.remove(id)).collect()
        };

        for entry in &removed {
            entry.timer.cancel();
        }
        if !removed.is_empty() {
            tracing::info!(user_id, count = removed.len(), "Cancelled follow-ups for user");
        }
        removed.len()
    }

    /// Fired tasks still awaiting acknowledgement.
    pub async fn pending_reminders(&self, user_id: &str) -> Vec<FollowUpTask> {
        self.collect(|t| t.user_id == user_id && t.status == FollowUpStatus::Fired)
            .await
    }

    /// Every live task for a user, earliest first.
    pub async fn tasks_for_user(&self, user_id: &str) -> Vec<FollowUpTask> {
        self.collect(|t| t.user_id == user_id).await
    }

    pub async fn get(&self, task_id: Uuid) -> Option<FollowUpTask> {
        self.table
            .read()
            .await
            .tasks
            .get(&task_id)
            .map(|e| e.task.clone())
    }

    /// Number of live (pending or fired) tasks.
    pub async fn len(&self) -> usize {
        self.table.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop the attempt counter kept for a session. Its live tasks stay.
    pub async fn forget_session(&self, session_id: Uuid) -> bool {
        self.table.write().await.attempts.remove(&session_id).is_some()
    }

    /// Sessions with an attempt counter.
    pub(crate) async fn tracked_sessions(&self) -> usize {
        self.table.read().await.attempts.len()
    }

    /// Stop every timer. Tasks stay in the table and can still be fired
    /// with [`fire_due`](Self::fire_due).
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        tracing::debug!("Follow-up scheduler shut down");
    }

    async fn collect(&self, filter: impl Fn(&FollowUpTask) -> bool) -> Vec<FollowUpTask> {
        let mut tasks: Vec<FollowUpTask> = self
            .table
            .read()
            .await
            .tasks
            .values()
            .map(|e| &e.task)
            .filter(|t| filter(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.scheduled_time);
        tasks
    }
}

/// Move a pending task to fired and announce it. Fired tasks never re-fire.
async fn fire(table: &RwLock<Table>, events: &EventBus, task_id: Uuid) -> Option<FollowUpTask> {
    let task = {
        let mut table = table.write().await;
        let entry = table.tasks.get_mut(&task_id)?;
        if entry.task.status != FollowUpStatus::Pending {
            return None;
        }
        entry.task.status = FollowUpStatus::Fired;
        entry.timer.cancel();
        entry.task.clone()
    };

    tracing::info!(
        task_id = %task_id,
        user_id = %task.user_id,
        task_type = %task.task_type,
        "Follow-up fired"
    );
    events.emit(
        EventKind::WelfareCheck,
        EventPayload::FollowUp { task: task.clone() },
    );
    Some(task)
}
