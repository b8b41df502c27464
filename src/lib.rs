//! Lifeline: crisis escalation and hotline-connection orchestration.
//!
//! Given an assessed crisis and the user's consent, Lifeline decides whether
//! to connect the user to a crisis counselor, keeps that connection healthy,
//! falls back to another channel when the first one fails, schedules
//! follow-up welfare checks, and reports outcomes.
//!
//! ```text
//! CrisisEvent --> SessionOrchestrator --consent?--> ConsentStore
//!                        |
//!                        +--> ChannelGateway.dial --> ConnectionMonitor
//!                        |
//!                        +--> on end: StatisticsAggregator, FollowUpScheduler
//!                        |
//!                        +--> EventBus --> observers
//! ```

pub mod cli;
pub mod clock;
pub mod config;
pub mod consent;
pub mod error;
pub mod events;
pub mod followup;
pub mod gateway;
pub mod session;
pub mod stats;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use session::{EscalationOutcome, SessionOrchestrator};
