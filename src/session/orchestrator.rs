//! Crisis session state machine.
//!
//! Every user owns a lane: a mutex around their single live-session slot.
//! All transitions for that user go through the lane, which keeps the "one
//! live session per user" invariant under concurrent connect, end, and
//! consent revocation. The lane is never held across a gateway call; after
//! each call the result is re-validated against the lane.
//!
//! ```text
//! handle_crisis --> connect --> dial primary --ok--> connected --> monitor attached
//!                                   |
//!                                   +--fail--> dial fallback --ok--> connected
//!                                                   |
//!                                                   +--fail--> ended(fallback-failed)
//!
//! end_session / revoke_consent / timeout --> ended(reason)
//!     --> cancel timers, hang up, record stats, schedule follow-up, session-ended
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::monitor::{ConnectionMonitor, MonitorDirective, MonitorSink};
use super::types::{
    CrisisContext, CrisisEvent, EndReason, InterventionKind, Session, SessionState, Severity,
};
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::consent::{ConsentChange, ConsentChangeKind, ConsentStore};
use crate::error::{FollowUpError, GatewayError, OrchestratorError};
use crate::events::{EventBus, EventKind, EventPayload};
use crate::followup::{FollowUpScheduler, FollowUpType};
use crate::gateway::{ChannelGateway, ConnectionHandle, DialRequest};
use crate::stats::{Statistics, StatisticsAggregator};

/// Result of [`SessionOrchestrator::handle_crisis`].
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationOutcome {
    /// The crisis was acute and a session was connected automatically.
    Connected(Session),
    /// No automatic connection; the user decides whether to reach out.
    AwaitingUser { severity: Severity },
}

/// A user's live-session slot.
#[derive(Default)]
struct Lane {
    live: Option<LiveSession>,
}

impl Lane {
    fn live_mut(&mut self, session_id: Uuid) -> Option<&mut LiveSession> {
        self.live.as_mut().filter(|l| l.session.id == session_id)
    }

    fn holds(&self, session_id: Uuid) -> bool {
        self.live.as_ref().is_some_and(|l| l.session.id == session_id)
    }
}

struct LiveSession {
    session: Session,
    handle: Option<ConnectionHandle>,
    cancel: CancellationToken,
    context: CrisisContext,
    consecutive_poor: u32,
}

/// A session just moved to `ended`, awaiting teardown outside the lane.
struct Retired {
    session: Session,
    handle: Option<ConnectionHandle>,
    cancel: CancellationToken,
}

enum DialOutcome {
    Connected(ConnectionHandle),
    Failed(String),
    Cancelled,
}

type LaneRef = Arc<Mutex<Lane>>;

/// Recently ended sessions, oldest evicted first.
struct EndedHistory {
    capacity: usize,
    order: VecDeque<Uuid>,
    sessions: HashMap<Uuid, Session>,
}

impl EndedHistory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            sessions: HashMap::new(),
        }
    }

    /// Insert a session and return the id evicted to make room, if any.
    fn insert(&mut self, session: Session) -> Option<Uuid> {
        let id = session.id;
        if self.sessions.insert(id, session).is_none() {
            self.order.push_back(id);
        }
        if self.order.len() <= self.capacity {
            return None;
        }
        let evicted = self.order.pop_front()?;
        self.sessions.remove(&evicted);
        Some(evicted)
    }

    fn get(&self, session_id: Uuid) -> Option<&Session> {
        self.sessions.get(&session_id)
    }
}

struct Inner {
    config: OrchestratorConfig,
    consent: Arc<ConsentStore>,
    gateway: Arc<dyn ChannelGateway>,
    events: Arc<EventBus>,
    followups: Arc<FollowUpScheduler>,
    stats: Arc<StatisticsAggregator>,
    monitor: ConnectionMonitor,
    clock: Arc<dyn Clock>,
    lanes: RwLock<HashMap<String, LaneRef>>,
    /// Session id to owning user, for live sessions and the ended history.
    owners: RwLock<HashMap<Uuid, String>>,
    ended: RwLock<EndedHistory>,
    shutdown: CancellationToken,
    weak_self: Weak<Inner>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Orchestrates crisis connections from risk signal to follow-up.
///
/// Cheap to clone; clones share state. Must be created inside a Tokio
/// runtime.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        consent: Arc<ConsentStore>,
        gateway: Arc<dyn ChannelGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = Arc::new(EventBus::new(Arc::clone(&clock)));
        Self::with_event_bus(config, consent, gateway, clock, events)
    }

    /// Build on an existing bus, so handlers registered beforehand also see
    /// `initialized`.
    pub fn with_event_bus(
        config: OrchestratorConfig,
        consent: Arc<ConsentStore>,
        gateway: Arc<dyn ChannelGateway>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        let followups = Arc::new(FollowUpScheduler::new(
            Arc::clone(&consent),
            Arc::clone(&events),
            Arc::clone(&clock),
        ));
        let stats = Arc::new(StatisticsAggregator::new(config.stats_window));
        let monitor = ConnectionMonitor::new(
            Arc::clone(&gateway),
            config.sampling_interval(),
            config.reconnect_delay(),
            config.dial_timeout(),
        );
        // Subscribe before anything can revoke.
        let consent_changes = consent.subscribe();
        let history = EndedHistory::new(config.stats_window);

        let inner = Arc::new_cyclic(|weak_self| Inner {
            config,
            consent,
            gateway,
            events,
            followups,
            stats,
            monitor,
            clock,
            lanes: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            ended: RwLock::new(history),
            shutdown: CancellationToken::new(),
            weak_self: weak_self.clone(),
        });

        tokio::spawn(watch_consent(
            Arc::downgrade(&inner),
            consent_changes,
            inner.shutdown.clone(),
        ));

        tracing::info!(
            gateway = inner.gateway.name(),
            auto_connect = inner.config.auto_connect,
            require_consent = inner.config.require_explicit_consent,
            "Session orchestrator initialized"
        );
        inner.events.emit(
            EventKind::Initialized,
            EventPayload::Initialized {
                gateway: inner.gateway.name().to_string(),
                auto_connect: inner.config.auto_connect,
            },
        );

        Self { inner }
    }

    /// Route an assessed crisis. Acute severities connect automatically when
    /// `auto_connect` is enabled; everything else waits for the user.
    pub async fn handle_crisis(
        &self,
        event: &CrisisEvent,
        context: CrisisContext,
    ) -> Result<EscalationOutcome, OrchestratorError> {
        if self.inner.config.auto_connect && event.severity.is_acute() {
            tracing::info!(
                user_id = %event.user_id,
                crisis_event_id = %event.id,
                severity = %event.severity,
                "Acute crisis; connecting automatically"
            );
            let session = self.connect(event, context).await?;
            return Ok(EscalationOutcome::Connected(session));
        }

        tracing::debug!(
            user_id = %event.user_id,
            severity = %event.severity,
            "Crisis below auto-connect threshold; awaiting user"
        );
        Ok(EscalationOutcome::AwaitingUser {
            severity: event.severity,
        })
    }

    /// Open a crisis connection for the event's user.
    ///
    /// Dials the primary channel, then the fallback channel once. Returns the
    /// connected session, or `DialFailed` after the session has ended with
    /// `fallback-failed`.
    pub async fn connect(
        &self,
        event: &CrisisEvent,
        context: CrisisContext,
    ) -> Result<Session, OrchestratorError> {
        let inner = &self.inner;
        let user_id = event.user_id.as_str();
        let lane = inner.lane(user_id).await;

        let (session_id, cancel, mut request) = {
            let mut slot = lane.lock().await;
            if let Some(live) = &slot.live {
                tracing::warn!(
                    user_id,
                    session_id = %live.session.id,
                    "Connect refused; user already has a live session"
                );
                return Err(OrchestratorError::SessionAlreadyActive {
                    user_id: user_id.to_string(),
                    session_id: live.session.id,
                });
            }

            if inner.consent_missing(user_id).await {
                tracing::info!(user_id, crisis_event_id = %event.id, "Consent required before connecting");
                inner.events.emit(
                    EventKind::ConsentRequired,
                    EventPayload::ConsentRequired {
                        user_id: user_id.to_string(),
                        crisis_event_id: event.id,
                        severity: event.severity,
                    },
                );
                return Err(OrchestratorError::ConsentRequired {
                    user_id: user_id.to_string(),
                });
            }

            let now = inner.clock.now();
            let channel = inner.config.primary_channel;
            let mut session = Session::new(event, channel, now);
            session.transition(SessionState::Connecting, now)?;
            session.dial_attempts = 1;
            session.record(InterventionKind::Dial, format!("dialing {}", channel), now);

            let request = DialRequest {
                session_id: session.id,
                user_id: user_id.to_string(),
                channel,
                severity: event.severity,
                context: context.clone(),
                attempt: 1,
            };
            let cancel = inner.shutdown.child_token();

            tracing::info!(
                user_id,
                session_id = %session.id,
                severity = %event.severity,
                channel = %channel,
                "Session connecting"
            );
            inner.owners.write().await.insert(session.id, user_id.to_string());
            inner.emit_session(EventKind::SessionUpdated, &session);

            let session_id = session.id;
            slot.live = Some(LiveSession {
                session,
                handle: None,
                cancel: cancel.clone(),
                context,
                consecutive_poor: 0,
            });
            (session_id, cancel, request)
        };

        loop {
            let outcome = inner.dial(&request, &cancel).await;

            let mut slot = lane.lock().await;
            if !slot.holds(session_id) || matches!(outcome, DialOutcome::Cancelled) {
                let retired = inner.retire(&mut slot, session_id, EndReason::UserInitiated).await;
                drop(slot);
                if let Some(retired) = retired {
                    inner.teardown(retired, None).await;
                }
                if let DialOutcome::Connected(handle) = &outcome {
                    inner.hangup(handle).await;
                }
                let reason = inner
                    .ended_reason(session_id)
                    .await
                    .unwrap_or(EndReason::UserInitiated);
                tracing::info!(session_id = %session_id, reason = %reason, "Connect interrupted");
                return Err(OrchestratorError::Interrupted { session_id, reason });
            }

            if inner.consent_missing(user_id).await {
                let retired = inner
                    .retire(&mut slot, session_id, EndReason::ConsentWithdrawn)
                    .await;
                drop(slot);
                if let Some(retired) = retired {
                    inner.teardown(retired, None).await;
                }
                if let DialOutcome::Connected(handle) = &outcome {
                    inner.hangup(handle).await;
                }
                return Err(OrchestratorError::Interrupted {
                    session_id,
                    reason: EndReason::ConsentWithdrawn,
                });
            }

            let Some(live) = slot.live_mut(session_id) else {
                return Err(OrchestratorError::NoActiveSession { session_id });
            };
            let now = inner.clock.now();

            match outcome {
                DialOutcome::Connected(handle) => {
                    live.session.transition(SessionState::Connected, now)?;
                    live.session.channel = handle.channel;
                    live.session.counselor_ref = handle.counselor_ref.clone();
                    live.session.connection_quality = handle.initial_quality.clamp(0.0, 1.0);
                    live.session.record(
                        InterventionKind::Dial,
                        format!("connected on {} ({})", handle.channel, handle.connection_id),
                        now,
                    );
                    live.handle = Some(handle.clone());

                    let snapshot = live.session.clone();
                    inner
                        .monitor
                        .attach(session_id, handle, &live.cancel, inner.sink());

                    tracing::info!(
                        user_id,
                        session_id = %session_id,
                        channel = %snapshot.channel,
                        attempts = snapshot.dial_attempts,
                        "Crisis session connected"
                    );
                    inner.emit_session(EventKind::Connected, &snapshot);
                    inner.emit_session(EventKind::SessionUpdated, &snapshot);
                    return Ok(snapshot);
                }
                DialOutcome::Failed(reason) => {
                    live.session.record(
                        InterventionKind::Dial,
                        format!("dial on {} failed: {}", request.channel, reason),
                        now,
                    );
                    tracing::warn!(
                        user_id,
                        session_id = %session_id,
                        channel = %request.channel,
                        attempt = request.attempt,
                        error = %reason,
                        "Dial failed"
                    );

                    if request.attempt == 1 && inner.config.enable_fallback {
                        let fallback = inner.config.fallback_channel;
                        live.session.transition(SessionState::Connecting, now)?;
                        live.session.channel = fallback;
                        live.session.fallback_used = true;
                        live.session.dial_attempts += 1;
                        live.session.record(
                            InterventionKind::Fallback,
                            format!("falling back to {}", fallback),
                            now,
                        );
                        inner.emit_session(EventKind::SessionUpdated, &live.session);

                        request.channel = fallback;
                        request.attempt = 2;
                        continue;
                    }

                    let attempts = live.session.dial_attempts;
                    let retired = inner
                        .retire(&mut slot, session_id, EndReason::FallbackFailed)
                        .await;
                    drop(slot);
                    if let Some(retired) = retired {
                        inner.teardown(retired, Some(reason.clone())).await;
                    }
                    return Err(OrchestratorError::DialFailed {
                        session_id,
                        attempts,
                        reason,
                    });
                }
                DialOutcome::Cancelled => {
                    return Err(OrchestratorError::Interrupted {
                        session_id,
                        reason: EndReason::UserInitiated,
                    });
                }
            }
        }
    }

    /// End a session. Ending an already-ended session is a no-op.
    pub async fn end_session(
        &self,
        session_id: Uuid,
        reason: EndReason,
    ) -> Result<(), OrchestratorError> {
        let inner = &self.inner;
        let Some(user_id) = inner.owner(session_id).await else {
            tracing::warn!(session_id = %session_id, "End requested for unknown session");
            return Err(OrchestratorError::NoActiveSession { session_id });
        };

        let lane = inner.lane(&user_id).await;
        let mut slot = lane.lock().await;
        // A revocation not yet seen by the watcher takes precedence.
        let reason = if slot.holds(session_id) && inner.consent_missing(&user_id).await {
            EndReason::ConsentWithdrawn
        } else {
            reason
        };
        match inner.retire(&mut slot, session_id, reason).await {
            Some(retired) => {
                drop(slot);
                inner.teardown(retired, None).await;
                Ok(())
            }
            None => {
                drop(slot);
                if inner.ended.read().await.get(session_id).is_some() {
                    tracing::debug!(session_id = %session_id, "Session already ended");
                    Ok(())
                } else {
                    tracing::warn!(session_id = %session_id, "End requested for session that is not live");
                    Err(OrchestratorError::NoActiveSession { session_id })
                }
            }
        }
    }

    /// Warm hand-off: move the live connection to a counselor with the given
    /// specialization without dropping it. Only valid while connected.
    pub async fn request_transfer(
        &self,
        session_id: Uuid,
        specialization: &str,
    ) -> Result<Session, OrchestratorError> {
        let inner = &self.inner;
        let (lane, handle) = inner
            .checked_handle(session_id, "transfer", |s| s == SessionState::Connected)
            .await?;

        let counselor = inner
            .bounded("transfer", inner.gateway.transfer(&handle, specialization))
            .await
            .inspect_err(|e| {
                tracing::warn!(session_id = %session_id, specialization, error = %e, "Warm hand-off failed");
            })?;

        let mut slot = lane.lock().await;
        let Some(live) = slot.live_mut(session_id) else {
            drop(slot);
            let reason = inner
                .ended_reason(session_id)
                .await
                .unwrap_or(EndReason::UserInitiated);
            return Err(OrchestratorError::Interrupted { session_id, reason });
        };
        let now = inner.clock.now();
        let previous = live.session.counselor_ref.replace(counselor.clone());
        live.session.record(
            InterventionKind::Transfer,
            format!("handed to {} specialist {}", specialization, counselor),
            now,
        );
        let snapshot = live.session.clone();
        drop(slot);

        tracing::info!(
            session_id = %session_id,
            specialization,
            counselor = %counselor,
            "Warm hand-off completed"
        );
        inner.events.emit(
            EventKind::WarmHandoff,
            EventPayload::Handoff {
                session: snapshot.clone(),
                previous_counselor: previous,
                specialization: specialization.to_string(),
            },
        );
        inner.emit_session(EventKind::SessionUpdated, &snapshot);
        Ok(snapshot)
    }

    /// Send a message over a connected or degraded session.
    pub async fn send_message(&self, session_id: Uuid, text: &str) -> Result<(), OrchestratorError> {
        let inner = &self.inner;
        let (lane, handle) = inner
            .checked_handle(session_id, "send message", |s| {
                matches!(s, SessionState::Connected | SessionState::Degraded)
            })
            .await?;

        inner
            .bounded("send", inner.gateway.send(&handle, text))
            .await?;

        let mut slot = lane.lock().await;
        if let Some(live) = slot.live_mut(session_id) {
            let now = inner.clock.now();
            live.session.record(
                InterventionKind::Message,
                format!("sent {} characters", text.chars().count()),
                now,
            );
        }
        tracing::debug!(session_id = %session_id, "Message sent");
        Ok(())
    }

    /// Withdraw a user's consent. Any live session ends with
    /// `consent-withdrawn` and pending follow-ups are cancelled before this
    /// returns.
    pub async fn revoke_consent(&self, user_id: &str) -> Option<Session> {
        let inner = &self.inner;
        let lane = inner.lane(user_id).await;

        // Revoke under the lane so no connect slips in between.
        let mut slot = lane.lock().await;
        inner.consent.revoke(user_id).await;
        let retired = match slot.live.as_ref().map(|l| l.session.id) {
            Some(session_id) => {
                inner
                    .retire(&mut slot, session_id, EndReason::ConsentWithdrawn)
                    .await
            }
            None => None,
        };
        drop(slot);

        let ended = match retired {
            Some(retired) => {
                let snapshot = retired.session.clone();
                inner.teardown(retired, None).await;
                Some(snapshot)
            }
            None => None,
        };
        inner.followups.cancel_for_user(user_id).await;
        ended
    }

    /// Snapshot of a session, live or ended.
    pub async fn session(&self, session_id: Uuid) -> Option<Session> {
        let inner = &self.inner;
        if let Some(user_id) = inner.owner(session_id).await {
            let lane = inner.lane(&user_id).await;
            let slot = lane.lock().await;
            if let Some(live) = slot.live.as_ref().filter(|l| l.session.id == session_id) {
                return Some(live.session.clone());
            }
        }
        inner.ended.read().await.get(session_id).cloned()
    }

    /// The user's live session, if any.
    pub async fn active_session(&self, user_id: &str) -> Option<Session> {
        let lane = self.inner.lanes.read().await.get(user_id).cloned()?;
        let slot = lane.lock().await;
        slot.live.as_ref().map(|l| l.session.clone())
    }

    /// Every live session.
    pub async fn live_sessions(&self) -> Vec<Session> {
        let lanes: Vec<LaneRef> = self.inner.lanes.read().await.values().cloned().collect();
        let mut sessions = Vec::new();
        for lane in lanes {
            if let Some(live) = &lane.lock().await.live {
                sessions.push(live.session.clone());
            }
        }
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub async fn statistics(&self) -> Statistics {
        self.inner.stats.snapshot().await
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn followups(&self) -> &Arc<FollowUpScheduler> {
        &self.inner.followups
    }

    pub fn consent(&self) -> &Arc<ConsentStore> {
        &self.inner.consent
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Number of sessions currently being sampled.
    pub fn monitored_sessions(&self) -> usize {
        self.inner.monitor.attached_count()
    }

    /// End every live session (`user-initiated`) and stop all background
    /// tasks.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let users: Vec<String> = inner.lanes.read().await.keys().cloned().collect();
        let mut ended = 0usize;
        for user_id in users {
            if inner
                .end_user_session(&user_id, EndReason::UserInitiated)
                .await
                .is_some()
            {
                ended += 1;
            }
        }
        inner.shutdown.cancel();
        inner.followups.shutdown();
        tracing::info!(ended, "Session orchestrator shut down");
    }
}

impl Inner {
    async fn lane(&self, user_id: &str) -> LaneRef {
        if let Some(lane) = self.lanes.read().await.get(user_id) {
            return Arc::clone(lane);
        }
        let mut lanes = self.lanes.write().await;
        if let Some(lane) = lanes.get(user_id) {
            return Arc::clone(lane);
        }
        // Nobody can clone a lane while the map is write-locked, so a lane
        // referenced only by the map and holding no session is idle.
        lanes.retain(|_, lane| {
            Arc::strong_count(lane) > 1
                || lane.try_lock().map_or(true, |slot| slot.live.is_some())
        });
        Arc::clone(lanes.entry(user_id.to_string()).or_default())
    }

    async fn owner(&self, session_id: Uuid) -> Option<String> {
        self.owners.read().await.get(&session_id).cloned()
    }

    async fn ended_reason(&self, session_id: Uuid) -> Option<EndReason> {
        self.ended
            .read()
            .await
            .get(session_id)
            .and_then(Session::end_reason)
    }

    /// Whether consent is required and absent.
    async fn consent_missing(&self, user_id: &str) -> bool {
        self.config.require_explicit_consent && !self.consent.has_consent(user_id).await
    }

    fn sink(&self) -> Arc<dyn MonitorSink> {
        Arc::new(MonitorLink {
            inner: self.weak_self.clone(),
        })
    }

    fn emit_session(&self, kind: EventKind, session: &Session) {
        self.events.emit(
            kind,
            EventPayload::Session {
                session: session.clone(),
            },
        );
    }

    /// Dial once, bounded by the dial timeout and the session's token.
    async fn dial(&self, request: &DialRequest, cancel: &CancellationToken) -> DialOutcome {
        let timeout = self.config.dial_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => DialOutcome::Cancelled,
            result = tokio::time::timeout(timeout, self.gateway.dial(request)) => match result {
                Ok(Ok(handle)) => DialOutcome::Connected(handle),
                Ok(Err(e)) => DialOutcome::Failed(e.to_string()),
                Err(_) => DialOutcome::Failed(
                    GatewayError::Timeout {
                        operation: "dial".to_string(),
                        timeout,
                    }
                    .to_string(),
                ),
            },
        }
    }

    /// Run a gateway call bounded by the dial timeout.
    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl std::future::Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        let timeout = self.config.dial_timeout();
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(GatewayError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                })
            })
    }

    async fn hangup(&self, handle: &ConnectionHandle) {
        if let Err(e) = self.bounded("hangup", self.gateway.hangup(handle)).await {
            tracing::warn!(connection_id = %handle.connection_id, error = %e, "Hangup failed");
        }
    }

    /// Validate a live session for a gateway operation and return its lane
    /// and connection handle.
    async fn checked_handle(
        &self,
        session_id: Uuid,
        operation: &'static str,
        allowed: impl Fn(SessionState) -> bool,
    ) -> Result<(LaneRef, ConnectionHandle), OrchestratorError> {
        let Some(user_id) = self.owner(session_id).await else {
            tracing::warn!(session_id = %session_id, operation, "Unknown session");
            return Err(OrchestratorError::NoActiveSession { session_id });
        };
        let lane = self.lane(&user_id).await;
        let mut slot = lane.lock().await;

        if !slot.holds(session_id) {
            drop(slot);
            return match self.ended.read().await.get(session_id) {
                Some(ended) => Err(OrchestratorError::InvalidState {
                    session_id,
                    state: ended.state,
                    operation,
                }),
                None => Err(OrchestratorError::NoActiveSession { session_id }),
            };
        }

        if self.consent_missing(&user_id).await {
            if let Some(retired) = self
                .retire(&mut slot, session_id, EndReason::ConsentWithdrawn)
                .await
            {
                drop(slot);
                self.teardown(retired, None).await;
            }
            return Err(OrchestratorError::InvalidState {
                session_id,
                state: SessionState::Ended(EndReason::ConsentWithdrawn),
                operation,
            });
        }

        let Some(live) = slot.live_mut(session_id) else {
            return Err(OrchestratorError::NoActiveSession { session_id });
        };
        if !allowed(live.session.state) {
            return Err(OrchestratorError::InvalidState {
                session_id,
                state: live.session.state,
                operation,
            });
        }
        let Some(handle) = live.handle.clone() else {
            return Err(OrchestratorError::InvalidState {
                session_id,
                state: live.session.state,
                operation,
            });
        };
        drop(slot);
        Ok((lane, handle))
    }

    /// Move the live session to `ended(reason)` and take it out of the lane.
    ///
    /// Returns `None` if the lane does not hold this session. Must be called
    /// with the lane locked; pass the result to [`teardown`](Self::teardown)
    /// after unlocking.
    async fn retire(&self, slot: &mut Lane, session_id: Uuid, reason: EndReason) -> Option<Retired> {
        if !slot.holds(session_id) {
            return None;
        }
        let mut live = slot.live.take()?;
        let now = self.clock.now();
        if let Err(e) = live.session.transition(SessionState::Ended(reason), now) {
            tracing::error!(session_id = %session_id, error = %e, "Session could not be ended");
        }
        let evicted = self.ended.write().await.insert(live.session.clone());
        if let Some(evicted) = evicted {
            self.owners.write().await.remove(&evicted);
            self.followups.forget_session(evicted).await;
            tracing::trace!(session_id = %evicted, "Evicted from ended-session history");
        }

        tracing::info!(
            user_id = %live.session.user_id,
            session_id = %session_id,
            reason = %reason,
            "Session ended"
        );
        Some(Retired {
            session: live.session,
            handle: live.handle,
            cancel: live.cancel,
        })
    }

    /// Everything that follows an end: stop timers, hang up, record
    /// statistics, schedule the follow-up, and announce the end.
    async fn teardown(&self, retired: Retired, failure: Option<String>) {
        let Retired {
            session,
            handle,
            cancel,
        } = retired;

        cancel.cancel();
        self.monitor.detach(session.id);
        if let Some(handle) = &handle {
            self.hangup(handle).await;
        }
        self.stats.record(&session).await;

        let reason = session.end_reason();
        if reason == Some(EndReason::FallbackFailed) {
            tracing::error!(
                user_id = %session.user_id,
                session_id = %session.id,
                attempts = session.dial_attempts,
                "Crisis connection could not be established on any channel"
            );
            self.events.emit(
                EventKind::FallbackFailed,
                EventPayload::FallbackFailed {
                    session: session.clone(),
                    attempts: session.dial_attempts,
                    reason: failure.unwrap_or_else(|| "no channel available".to_string()),
                },
            );
        }

        if self.config.enable_follow_up {
            let task_type = if session.severity.is_acute() || reason == Some(EndReason::FallbackFailed) {
                FollowUpType::WelfareCheck
            } else {
                FollowUpType::CheckIn
            };
            match self
                .followups
                .schedule(
                    session.id,
                    &session.user_id,
                    task_type,
                    self.config.follow_up_horizon(),
                )
                .await
            {
                Ok(task) => {
                    tracing::debug!(session_id = %session.id, task_id = %task.id, "Follow-up queued");
                }
                Err(FollowUpError::ConsentDenied { .. }) => {
                    tracing::debug!(session_id = %session.id, "No follow-up without consent");
                }
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "Failed to schedule follow-up");
                }
            }
        }

        self.emit_session(EventKind::SessionEnded, &session);
    }

    async fn end_user_session(&self, user_id: &str, reason: EndReason) -> Option<Session> {
        let lane = self.lanes.read().await.get(user_id).cloned()?;
        let mut slot = lane.lock().await;
        let session_id = slot.live.as_ref()?.session.id;
        let retired = self.retire(&mut slot, session_id, reason).await?;
        drop(slot);

        let snapshot = retired.session.clone();
        self.teardown(retired, None).await;
        Some(snapshot)
    }

    /// End any live session whose user no longer has consent.
    async fn reconcile_consent(&self) {
        if !self.config.require_explicit_consent {
            return;
        }
        let users: Vec<String> = self.lanes.read().await.keys().cloned().collect();
        for user_id in users {
            if !self.consent.has_consent(&user_id).await {
                self.end_user_session(&user_id, EndReason::ConsentWithdrawn)
                    .await;
            }
        }
    }

    async fn on_quality_sample(&self, session_id: Uuid, quality: f64) -> MonitorDirective {
        let Some(user_id) = self.owner(session_id).await else {
            return MonitorDirective::Stop;
        };
        let lane = self.lane(&user_id).await;
        let mut slot = lane.lock().await;
        if !slot.holds(session_id) {
            return MonitorDirective::Stop;
        }

        if self.consent_missing(&user_id).await {
            if let Some(retired) = self
                .retire(&mut slot, session_id, EndReason::ConsentWithdrawn)
                .await
            {
                drop(slot);
                self.teardown(retired, None).await;
            }
            return MonitorDirective::Stop;
        }

        let Some(live) = slot.live_mut(session_id) else {
            return MonitorDirective::Stop;
        };
        let now = self.clock.now();
        live.session.connection_quality = quality;
        self.emit_session(EventKind::MonitoringUpdate, &live.session);

        if quality >= self.config.poor_quality_threshold {
            live.consecutive_poor = 0;
            if live.session.state == SessionState::Degraded {
                if let Err(e) = live.session.transition(SessionState::Connected, now) {
                    tracing::error!(session_id = %session_id, error = %e, "Recovery transition rejected");
                    return MonitorDirective::Continue;
                }
                tracing::info!(session_id = %session_id, quality, "Connection quality recovered");
                self.emit_session(EventKind::SessionUpdated, &live.session);
            }
            return MonitorDirective::Continue;
        }

        live.consecutive_poor += 1;
        let consecutive_poor = live.consecutive_poor;

        if live.session.state == SessionState::Connected {
            if let Err(e) = live.session.transition(SessionState::Degraded, now) {
                tracing::error!(session_id = %session_id, error = %e, "Degrade transition rejected");
                return MonitorDirective::Continue;
            }
            live.session.record(
                InterventionKind::QualityDrop,
                format!("quality {:.2}", quality),
                now,
            );
            tracing::warn!(session_id = %session_id, quality, "Connection quality poor");
            self.events.emit(
                EventKind::ConnectionQualityPoor,
                EventPayload::QualityPoor {
                    session: live.session.clone(),
                    quality,
                    consecutive_poor,
                },
            );
            self.emit_session(EventKind::SessionUpdated, &live.session);
        }

        if consecutive_poor >= self.config.poor_samples_before_reconnect {
            // One reconnect per session.
            if live.session.reconnect_attempted {
                tracing::warn!(
                    session_id = %session_id,
                    consecutive_poor,
                    "Quality still poor after reconnect; giving up"
                );
                if let Some(retired) = self.retire(&mut slot, session_id, EndReason::Timeout).await {
                    drop(slot);
                    self.teardown(retired, None).await;
                }
                return MonitorDirective::Stop;
            }
            return MonitorDirective::Reconnect;
        }
        MonitorDirective::Continue
    }

    async fn on_reconnect(&self, session_id: Uuid) -> Option<ConnectionHandle> {
        let user_id = self.owner(session_id).await?;
        let lane = self.lane(&user_id).await;

        let (old_handle, request, cancel) = {
            let mut slot = lane.lock().await;
            if !slot.holds(session_id) {
                return None;
            }
            if self.consent_missing(&user_id).await {
                if let Some(retired) = self
                    .retire(&mut slot, session_id, EndReason::ConsentWithdrawn)
                    .await
                {
                    drop(slot);
                    self.teardown(retired, None).await;
                }
                return None;
            }

            let live = slot.live_mut(session_id)?;
            let now = self.clock.now();
            live.session.reconnect_attempted = true;
            live.session.dial_attempts += 1;
            live.session.record(
                InterventionKind::Reconnect,
                format!("reconnecting on {}", live.session.channel),
                now,
            );
            let request = DialRequest {
                session_id,
                user_id: user_id.clone(),
                channel: live.session.channel,
                severity: live.session.severity,
                context: live.context.clone(),
                attempt: live.session.dial_attempts,
            };
            tracing::info!(session_id = %session_id, channel = %request.channel, "Attempting reconnect");
            (live.handle.take(), request, live.cancel.clone())
        };

        if let Some(old) = &old_handle {
            self.hangup(old).await;
        }
        let outcome = self.dial(&request, &cancel).await;

        let mut slot = lane.lock().await;
        if !slot.holds(session_id) || matches!(outcome, DialOutcome::Cancelled) {
            drop(slot);
            if let DialOutcome::Connected(handle) = &outcome {
                self.hangup(handle).await;
            }
            return None;
        }

        let live = slot.live_mut(session_id)?;
        let now = self.clock.now();
        match outcome {
            DialOutcome::Connected(handle) => {
                if let Err(e) = live.session.transition(SessionState::Connected, now) {
                    tracing::error!(session_id = %session_id, error = %e, "Reconnect transition rejected");
                }
                live.consecutive_poor = 0;
                live.session.connection_quality = handle.initial_quality.clamp(0.0, 1.0);
                if handle.counselor_ref.is_some() {
                    live.session.counselor_ref = handle.counselor_ref.clone();
                }
                live.session.record(
                    InterventionKind::Reconnect,
                    format!("reconnected ({})", handle.connection_id),
                    now,
                );
                live.handle = Some(handle.clone());
                tracing::info!(session_id = %session_id, "Reconnect succeeded");
                self.emit_session(EventKind::SessionUpdated, &live.session);
                Some(handle)
            }
            DialOutcome::Failed(reason) => {
                live.session.record(
                    InterventionKind::Reconnect,
                    format!("reconnect failed: {}", reason),
                    now,
                );
                tracing::warn!(session_id = %session_id, error = %reason, "Reconnect failed; ending session");
                if let Some(retired) = self.retire(&mut slot, session_id, EndReason::Timeout).await {
                    drop(slot);
                    self.teardown(retired, None).await;
                }
                None
            }
            DialOutcome::Cancelled => None,
        }
    }
}

/// Monitor callback that does not keep the orchestrator alive.
struct MonitorLink {
    inner: Weak<Inner>,
}

#[async_trait]
impl MonitorSink for MonitorLink {
    async fn quality_sampled(&self, session_id: Uuid, quality: f64) -> MonitorDirective {
        match self.inner.upgrade() {
            Some(inner) => inner.on_quality_sample(session_id, quality).await,
            None => MonitorDirective::Stop,
        }
    }

    async fn reconnect(&self, session_id: Uuid) -> Option<ConnectionHandle> {
        let inner = self.inner.upgrade()?;
        inner.on_reconnect(session_id).await
    }
}

/// End live sessions as soon as the store reports a revocation.
async fn watch_consent(
    inner: Weak<Inner>,
    mut changes: broadcast::Receiver<ConsentChange>,
    shutdown: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            change = changes.recv() => change,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match change {
            Ok(ConsentChange {
                user_id,
                kind: ConsentChangeKind::Revoked,
                ..
            }) => {
                if inner
                    .end_user_session(&user_id, EndReason::ConsentWithdrawn)
                    .await
                    .is_some()
                {
                    tracing::info!(user_id = %user_id, "Ended session after consent revocation");
                }
                inner.followups.cancel_for_user(&user_id).await;
            }
            Ok(ConsentChange {
                user_id,
                kind: ConsentChangeKind::Updated,
                record: Some(record),
            }) if !record.follow_up_consent => {
                inner.followups.cancel_for_user(&user_id).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Consent watcher lagged; reconciling");
                inner.reconcile_consent().await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::debug!("Consent watcher stopped");
}
