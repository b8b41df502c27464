//! Post-crisis follow-up.
//!
//! When a session ends and the user allows it, a welfare check is scheduled.
//! It fires once, stays visible as a reminder, and is removed when the user
//! acknowledges it or it is cancelled.
//!
//! ```text
//! session ended --> schedule --> [timer] --> welfare-check --> acknowledge --> followup-completed
//! ```

mod scheduler;
mod types;

pub use scheduler::FollowUpScheduler;
pub use types::{FollowUpStatus, FollowUpTask, FollowUpType};
