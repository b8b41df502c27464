//! Per-user consent records.
//!
//! A user must grant consent before automated crisis intervention acts on
//! their behalf. Withdrawal is immediate: the store publishes every change so
//! the orchestrator can tear down a session the moment consent disappears.
//!
//! ```text
//! UI grants consent      --> grant(user, record)     --> Granted
//! UI toggles a flag      --> update(user, partial)   --> Updated
//! User withdraws         --> revoke(user)            --> Revoked
//! Orchestrator checks    --> get(user)
//! ```

mod store;
mod types;

pub use store::ConsentStore;
pub use types::{ConsentChange, ConsentChangeKind, ConsentRecord, ConsentUpdate};
