//! Event bus connecting the orchestrator to external observers.
//!
//! Every session, consent, and follow-up transition is published here under
//! one of the names in [`EventKind`]. Observers either register callbacks with
//! [`EventBus::on`] or take a broadcast receiver from [`EventBus::subscribe`].

mod bus;
mod types;

pub use bus::{EventBus, EventHandler, SubscriptionHandle};
pub use types::{CrisisNotification, EventKind, EventPayload};
