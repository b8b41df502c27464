//! Crisis sessions: data model, state machine, and quality monitoring.

mod monitor;
mod orchestrator;
mod types;

pub use monitor::{ConnectionMonitor, MonitorDirective, MonitorSink};
pub use orchestrator::{EscalationOutcome, SessionOrchestrator};
pub use types::{
    CrisisContext, CrisisEvent, EndReason, Intervention, InterventionKind, MoodSample, Session,
    SessionState, Severity, SuicidalIdeation,
};
