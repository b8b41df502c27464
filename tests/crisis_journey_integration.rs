//! Integration tests from a user's perspective.
//!
//! These tests drive complete crisis journeys through the public API with the
//! simulated gateway: configuration, consent, escalation, channel failure,
//! quality monitoring, follow-up, and concurrent access.
//!
//! Run: `cargo test --test crisis_journey_integration`

use std::sync::{Arc, Mutex};

use lifeline::clock::{Clock, SystemClock};
use lifeline::consent::{ConsentRecord, ConsentStore};
use lifeline::events::{CrisisNotification, EventBus, EventKind};
use lifeline::gateway::SimulatedGateway;
use lifeline::{OrchestratorConfig, SessionOrchestrator};

/// Orchestrator wired to a simulated gateway with every event recorded.
struct Journey {
    orchestrator: SessionOrchestrator,
    gateway: Arc<SimulatedGateway>,
    seen: Arc<Mutex<Vec<CrisisNotification>>>,
}

impl Journey {
    fn new(config: OrchestratorConfig, gateway: SimulatedGateway) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let consent = Arc::new(ConsentStore::new(Arc::clone(&clock)));
        let gateway = Arc::new(gateway);
        let events = Arc::new(EventBus::new(Arc::clone(&clock)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let seen = Arc::clone(&seen);
            events.on(kind, move |n| seen.lock().unwrap().push(n.clone()));
        }

        let orchestrator =
            SessionOrchestrator::with_event_bus(config, consent, gateway.clone(), clock, events);
        Self {
            orchestrator,
            gateway,
            seen,
        }
    }

    async fn grant(&self, user_id: &str) {
        self.orchestrator
            .consent()
            .grant(user_id, ConsentRecord::granting_all())
            .await;
    }

    async fn kinds(&self) -> Vec<EventKind> {
        self.orchestrator.events().flush().await;
        self.seen.lock().unwrap().iter().map(|n| n.kind).collect()
    }
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        sampling_interval_ms: 100,
        reconnect_delay_ms: 50,
        dial_timeout_ms: 1_000,
        follow_up_horizon_secs: 3_600,
        ..OrchestratorConfig::default()
    }
}

// ============================================================================
// 1. Configuration Journey
// ============================================================================
mod configuration {
    use lifeline::OrchestratorConfig;
    use lifeline::error::ConfigError;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_safe() {
        let config = OrchestratorConfig::default();
        assert!(config.auto_connect);
        assert!(config.require_explicit_consent);
        assert!(config.enable_fallback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lifeline.json");
        std::fs::write(&path, r#"{"enable_follow_up": false, "stats_window": 50}"#).unwrap();

        let config = OrchestratorConfig::load_from(&path).unwrap();
        assert!(!config.enable_follow_up);
        assert_eq!(config.stats_window, 50);
        assert_eq!(config.poor_samples_before_reconnect, 3);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lifeline.json");
        std::fs::write(&path, r#"{"poor_quality_threshold": 4.0}"#).unwrap();

        let err = OrchestratorConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}

// ============================================================================
// 2. Escalation Journey
// ============================================================================
mod escalation {
    use lifeline::EscalationOutcome;
    use lifeline::error::OrchestratorError;
    use lifeline::events::EventKind;
    use lifeline::gateway::SimulatedGateway;
    use lifeline::session::{CrisisContext, CrisisEvent, EndReason, SessionState, Severity};

    use super::{Journey, fast_config};

    #[tokio::test]
    async fn test_imminent_crisis_connects_and_ends_cleanly() {
        let journey = Journey::new(fast_config(), SimulatedGateway::new());
        journey.grant("alex").await;

        let event = CrisisEvent::new("alex", Severity::Imminent, "journal")
            .with_risk_factors(["isolation"])
            .with_protective_factors(["pet"]);
        let outcome = journey
            .orchestrator
            .handle_crisis(&event, CrisisContext::default())
            .await
            .unwrap();
        let EscalationOutcome::Connected(session) = outcome else {
            panic!("imminent crisis should connect");
        };
        assert_eq!(session.state, SessionState::Connected);
        assert_eq!(session.crisis_event_id, event.id);

        journey
            .orchestrator
            .end_session(session.id, EndReason::UserInitiated)
            .await
            .unwrap();

        let kinds = journey.kinds().await;
        assert_eq!(kinds.first(), Some(&EventKind::Initialized));
        assert!(kinds.contains(&EventKind::Connected));
        assert_eq!(kinds.last(), Some(&EventKind::SessionEnded));
    }

    #[tokio::test]
    async fn test_low_severity_waits_for_user() {
        let journey = Journey::new(fast_config(), SimulatedGateway::new());
        journey.grant("alex").await;

        for severity in [Severity::Low, Severity::Medium, Severity::High] {
            let outcome = journey
                .orchestrator
                .handle_crisis(
                    &CrisisEvent::new("alex", severity, "chat"),
                    CrisisContext::default(),
                )
                .await
                .unwrap();
            assert_eq!(outcome, EscalationOutcome::AwaitingUser { severity });
        }
        assert_eq!(journey.gateway.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_consent_surfaces_prompt() {
        let journey = Journey::new(fast_config(), SimulatedGateway::new());

        let err = journey
            .orchestrator
            .handle_crisis(
                &CrisisEvent::new("alex", Severity::Critical, "panic-button"),
                CrisisContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ConsentRequired { .. }));
        assert!(journey.kinds().await.contains(&EventKind::ConsentRequired));

        // Granting consent unblocks the next attempt.
        journey.grant("alex").await;
        let outcome = journey
            .orchestrator
            .handle_crisis(
                &CrisisEvent::new("alex", Severity::Critical, "panic-button"),
                CrisisContext::default(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, EscalationOutcome::Connected(_)));
    }
}

// ============================================================================
// 3. Channel Failure Journey
// ============================================================================
mod channel_failure {
    use lifeline::error::OrchestratorError;
    use lifeline::events::{EventKind, EventPayload};
    use lifeline::gateway::{DialScript, SimulatedGateway};
    use lifeline::session::{CrisisContext, CrisisEvent, EndReason, Severity};

    use super::{Journey, fast_config};

    #[tokio::test]
    async fn test_both_channels_down_reports_fallback_failed() {
        let gateway = SimulatedGateway::new().with_dials([
            DialScript::Fail("busy".into()),
            DialScript::Fail("no carrier".into()),
        ]);
        let journey = Journey::new(fast_config(), gateway);
        journey.grant("sam").await;

        let err = journey
            .orchestrator
            .connect(
                &CrisisEvent::new("sam", Severity::Critical, "chat"),
                CrisisContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DialFailed { attempts: 2, .. }));

        journey.orchestrator.events().flush().await;
        let failure = journey
            .seen
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.kind == EventKind::FallbackFailed)
            .cloned()
            .unwrap();
        let EventPayload::FallbackFailed {
            session, reason, ..
        } = failure.payload
        else {
            panic!("unexpected payload");
        };
        assert_eq!(session.end_reason(), Some(EndReason::FallbackFailed));
        assert!(reason.contains("no carrier"));

        // The failed session frees the lane for a later attempt.
        let retry = journey
            .orchestrator
            .connect(
                &CrisisEvent::new("sam", Severity::Critical, "chat"),
                CrisisContext::default(),
            )
            .await
            .unwrap();
        assert!(retry.is_live());
        assert_eq!(journey.gateway.dial_count(), 3);
    }
}

// ============================================================================
// 4. Quality Monitoring Journey
// ============================================================================
mod quality_monitoring {
    use std::time::Duration;

    use lifeline::events::EventKind;
    use lifeline::gateway::{DialScript, SimulatedGateway};
    use lifeline::session::{CrisisContext, CrisisEvent, EndReason, Severity};

    use super::{Journey, fast_config};

    #[tokio::test(start_paused = true)]
    async fn test_persistent_poor_quality_times_out_after_one_reconnect() {
        let gateway = SimulatedGateway::new().with_quality([0.05, 0.05, 0.05]);
        let journey = Journey::new(fast_config(), gateway);
        journey.grant("kai").await;

        let session = journey
            .orchestrator
            .connect(
                &CrisisEvent::new("kai", Severity::High, "chat"),
                CrisisContext::default(),
            )
            .await
            .unwrap();
        journey
            .gateway
            .push_dials([DialScript::Fail("line dropped".into())]);

        tokio::time::sleep(Duration::from_secs(2)).await;

        let ended = journey.orchestrator.session(session.id).await.unwrap();
        assert_eq!(ended.end_reason(), Some(EndReason::Timeout));
        assert_eq!(journey.gateway.dial_count(), 2);

        let kinds = journey.kinds().await;
        let poor = kinds
            .iter()
            .filter(|k| **k == EventKind::ConnectionQualityPoor)
            .count();
        assert_eq!(poor, 1);
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == EventKind::SessionEnded)
                .count(),
            1
        );

        // Nothing keeps sampling an ended session.
        let samples_before = journey.gateway.calls().len();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(journey.gateway.calls().len(), samples_before);
    }
}

// ============================================================================
// 5. Follow-up Journey
// ============================================================================
mod follow_up {
    use std::time::Duration;

    use lifeline::events::EventKind;
    use lifeline::followup::FollowUpStatus;
    use lifeline::gateway::SimulatedGateway;
    use lifeline::session::{CrisisContext, CrisisEvent, EndReason, Severity};

    use super::{Journey, fast_config};

    #[tokio::test(start_paused = true)]
    async fn test_follow_up_fires_and_is_acknowledged() {
        let journey = Journey::new(fast_config(), SimulatedGateway::new());
        journey.grant("rio").await;

        let session = journey
            .orchestrator
            .connect(
                &CrisisEvent::new("rio", Severity::Critical, "chat"),
                CrisisContext::default(),
            )
            .await
            .unwrap();
        journey
            .orchestrator
            .end_session(session.id, EndReason::UserInitiated)
            .await
            .unwrap();

        let followups = journey.orchestrator.followups();
        let tasks = followups.tasks_for_user("rio").await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, FollowUpStatus::Pending);

        tokio::time::sleep(Duration::from_secs(3_601)).await;

        let reminders = followups.pending_reminders("rio").await;
        assert_eq!(reminders.len(), 1);
        followups.acknowledge(reminders[0].id).await.unwrap();
        assert!(followups.pending_reminders("rio").await.is_empty());

        let kinds = journey.kinds().await;
        assert!(kinds.contains(&EventKind::WelfareCheck));
        assert!(kinds.contains(&EventKind::FollowUpCompleted));
    }

    #[tokio::test]
    async fn test_revocation_leaves_no_follow_up() {
        let journey = Journey::new(fast_config(), SimulatedGateway::new());
        journey.grant("rio").await;

        journey
            .orchestrator
            .connect(
                &CrisisEvent::new("rio", Severity::Critical, "chat"),
                CrisisContext::default(),
            )
            .await
            .unwrap();
        let ended = journey.orchestrator.revoke_consent("rio").await.unwrap();

        assert_eq!(ended.end_reason(), Some(EndReason::ConsentWithdrawn));
        assert!(journey.orchestrator.followups().is_empty().await);
    }
}

// ============================================================================
// 6. Concurrency
// ============================================================================
mod concurrency {
    use std::time::Duration;

    use futures::future::join_all;
    use lifeline::error::OrchestratorError;
    use lifeline::gateway::{DialScript, SimulatedGateway};
    use lifeline::session::{CrisisContext, CrisisEvent, EndReason, Severity};

    use super::{Journey, fast_config};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connects_yield_one_session() {
        let gateway =
            SimulatedGateway::new().with_dials([DialScript::Delay(Duration::from_millis(50))]);
        let journey = Journey::new(fast_config(), gateway);
        journey.grant("noa").await;

        let attempts = (0..8).map(|_| {
            let orchestrator = journey.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .connect(
                        &CrisisEvent::new("noa", Severity::Critical, "chat"),
                        CrisisContext::default(),
                    )
                    .await
            })
        });
        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let connected = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(OrchestratorError::SessionAlreadyActive { .. })))
            .count();
        assert_eq!(connected, 1);
        assert_eq!(rejected, 7);
        assert_eq!(journey.gateway.dial_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_end_emits_single_session_ended() {
        let journey = Journey::new(fast_config(), SimulatedGateway::new());
        journey.grant("noa").await;
        let session = journey
            .orchestrator
            .connect(
                &CrisisEvent::new("noa", Severity::Critical, "chat"),
                CrisisContext::default(),
            )
            .await
            .unwrap();

        let ends = [
            EndReason::UserInitiated,
            EndReason::Timeout,
            EndReason::UserInitiated,
            EndReason::Timeout,
        ]
        .into_iter()
        .map(|reason| {
            let orchestrator = journey.orchestrator.clone();
            tokio::spawn(async move { orchestrator.end_session(session.id, reason).await })
        });
        for result in join_all(ends).await {
            assert!(result.unwrap().is_ok());
        }

        let ended = journey.orchestrator.session(session.id).await.unwrap();
        assert!(ended.end_reason().is_some());
        let ended_events = journey
            .kinds()
            .await
            .into_iter()
            .filter(|k| *k == lifeline::events::EventKind::SessionEnded)
            .count();
        assert_eq!(ended_events, 1);
    }
}
