//! Scenario simulator.
//!
//! Drives one crisis through the orchestrator against [`SimulatedGateway`]
//! and prints every event as a JSON line on stdout, followed by a summary.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use serde_json::json;

use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::consent::{ConsentRecord, ConsentStore};
use crate::error::OrchestratorError;
use crate::events::{CrisisNotification, EventBus, EventKind};
use crate::gateway::{DialScript, SimulatedGateway};
use crate::session::{
    CrisisContext, CrisisEvent, EndReason, EscalationOutcome, Session, SessionOrchestrator, Severity,
};

/// Quality reported by the simulator for a poor sample.
const POOR_QUALITY: f64 = 0.1;

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// User to simulate
    #[arg(short, long, default_value = "demo-user")]
    pub user: String,

    /// Assessed severity (low, medium, high, critical, imminent)
    #[arg(short, long, default_value = "critical")]
    pub severity: Severity,

    /// Connect even when the severity does not auto-connect
    #[arg(long)]
    pub user_confirms: bool,

    /// Do not grant consent before the crisis
    #[arg(long)]
    pub no_consent: bool,

    /// Grant consent without follow-up contact
    #[arg(long)]
    pub no_follow_up: bool,

    /// Fail the primary dial
    #[arg(long)]
    pub fail_primary: bool,

    /// Fail the dial after the primary (fallback or reconnect)
    #[arg(long)]
    pub fail_fallback: bool,

    /// Report this many poor quality samples after connecting
    #[arg(long, default_value = "0")]
    pub poor_samples: u32,

    /// Request a warm hand-off to this specialization
    #[arg(long)]
    pub transfer: Option<String>,

    /// Send this message once connected
    #[arg(long)]
    pub message: Option<String>,

    /// How long to keep the session open (milliseconds)
    #[arg(long, default_value = "2000")]
    pub hold_ms: u64,

    /// Withdraw consent instead of ending the session normally
    #[arg(long)]
    pub revoke: bool,

    /// Use short sampling and reconnect intervals
    #[arg(long)]
    pub fast: bool,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,
}

/// Run the simulation.
pub async fn run_simulate_command(
    mut config: OrchestratorConfig,
    args: SimulateArgs,
) -> anyhow::Result<()> {
    if args.fast {
        config.sampling_interval_ms = 100;
        config.reconnect_delay_ms = 50;
    }
    config.validate()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let consent = Arc::new(ConsentStore::new(Arc::clone(&clock)));
    if !args.no_consent {
        consent
            .grant(
                &args.user,
                ConsentRecord::granting_all().with_follow_up(!args.no_follow_up),
            )
            .await;
    }

    let gateway = Arc::new(scripted_gateway(&args));
    let events = Arc::new(EventBus::new(Arc::clone(&clock)));
    for kind in EventKind::ALL {
        let pretty = args.pretty;
        events.on(kind, move |n| print_notification(n, pretty));
    }

    let orchestrator =
        SessionOrchestrator::with_event_bus(config, consent, gateway, clock, events);

    let event = CrisisEvent::new(&args.user, args.severity, "simulator");
    let context = CrisisContext {
        support_available: true,
        location_safe: true,
        ..CrisisContext::default()
    };

    if let Some(session) = escalate(&orchestrator, &event, context, &args).await? {
        drive(&orchestrator, &session, &args).await;
    }

    orchestrator.events().flush().await;
    let followups = orchestrator.followups().tasks_for_user(&args.user).await;
    let summary = json!({
        "statistics": orchestrator.statistics().await,
        "followups": followups,
    });
    orchestrator.shutdown().await;
    orchestrator.events().flush().await;

    print_json(&summary, args.pretty);
    Ok(())
}

fn scripted_gateway(args: &SimulateArgs) -> SimulatedGateway {
    let gateway = SimulatedGateway::new();
    if args.fail_primary {
        gateway.push_dials([DialScript::Fail("primary line busy".to_string())]);
    } else {
        gateway.push_dials([DialScript::Connect]);
    }
    if args.fail_fallback {
        gateway.push_dials([DialScript::Fail("no carrier".to_string())]);
    }
    gateway.push_quality((0..args.poor_samples).map(|_| POOR_QUALITY));
    gateway
}

async fn escalate(
    orchestrator: &SessionOrchestrator,
    event: &CrisisEvent,
    context: CrisisContext,
    args: &SimulateArgs,
) -> crate::Result<Option<Session>> {
    let outcome = orchestrator.handle_crisis(event, context.clone()).await;
    let result = match outcome {
        Ok(EscalationOutcome::Connected(session)) => Ok(session),
        Ok(EscalationOutcome::AwaitingUser { severity }) if args.user_confirms => {
            tracing::info!(severity = %severity, "User confirmed; connecting");
            orchestrator.connect(event, context).await
        }
        Ok(EscalationOutcome::AwaitingUser { severity }) => {
            tracing::info!(
                severity = %severity,
                "No automatic connection; pass --user-confirms to connect"
            );
            return Ok(None);
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(session) => Ok(Some(session)),
        Err(OrchestratorError::ConsentRequired { user_id }) => {
            tracing::warn!(user_id = %user_id, "Consent required; prompt the user");
            Ok(None)
        }
        Err(OrchestratorError::DialFailed { attempts, reason, .. }) => {
            tracing::error!(
                attempts,
                reason = %reason,
                "No crisis line reachable; direct the user to call or text 988"
            );
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

async fn drive(orchestrator: &SessionOrchestrator, session: &Session, args: &SimulateArgs) {
    if let Some(text) = &args.message
        && let Err(e) = orchestrator.send_message(session.id, text).await
    {
        tracing::warn!(error = %e, "Message not sent");
    }

    if let Some(specialization) = &args.transfer
        && let Err(e) = orchestrator.request_transfer(session.id, specialization).await
    {
        tracing::warn!(error = %e, "Warm hand-off not completed");
    }

    tokio::time::sleep(Duration::from_millis(args.hold_ms)).await;

    if args.revoke {
        orchestrator.revoke_consent(&args.user).await;
    } else if let Err(e) = orchestrator
        .end_session(session.id, EndReason::UserInitiated)
        .await
    {
        tracing::warn!(error = %e, "End session failed");
    }
}

fn print_notification(notification: &CrisisNotification, pretty: bool) {
    match serde_json::to_value(notification) {
        Ok(value) => print_json(&value, pretty),
        Err(e) => tracing::warn!(event = %notification.kind, error = %e, "Event not serializable"),
    }
}

fn print_json(value: &serde_json::Value, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!(error = %e, "Output not serializable"),
    }
}
