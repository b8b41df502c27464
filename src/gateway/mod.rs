//! Crisis channel transport boundary.
//!
//! The orchestrator never talks to a hotline, SMS carrier, or chat backend
//! directly. Everything crossing that line goes through [`ChannelGateway`],
//! and every call on it is treated as fallible.

mod simulated;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::session::{CrisisContext, Severity};

pub use simulated::{DialScript, GatewayCall, SimulatedGateway};

/// Transport used to reach a crisis counselor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Voice call to the hotline.
    Voice,
    /// SMS text line.
    Text,
    /// Web chat.
    Chat,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voice => write!(f, "voice"),
            Self::Text => write!(f, "text"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "voice" | "call" => Ok(Self::Voice),
            "text" | "sms" => Ok(Self::Text),
            "chat" => Ok(Self::Chat),
            other => Err(format!("unknown channel kind '{}'", other)),
        }
    }
}

/// Everything a gateway needs to place a crisis connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialRequest {
    pub session_id: Uuid,
    pub user_id: String,
    pub channel: ChannelKind,
    pub severity: Severity,
    pub context: CrisisContext,
    /// 1 for the primary dial, 2 for the fallback or reconnect dial.
    pub attempt: u32,
}

/// An established connection returned by [`ChannelGateway::dial`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHandle {
    pub connection_id: String,
    pub channel: ChannelKind,
    /// Counselor who picked up, if the transport reports one.
    pub counselor_ref: Option<String>,
    /// Quality at connect time (0.0 to 1.0).
    pub initial_quality: f64,
}

/// Abstraction over the hotline / SMS / chat transport.
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    /// Gateway name, for logs.
    fn name(&self) -> &str;

    /// Place a connection.
    async fn dial(&self, request: &DialRequest) -> Result<ConnectionHandle, GatewayError>;

    /// Send a message over an established connection.
    async fn send(&self, handle: &ConnectionHandle, message: &str) -> Result<(), GatewayError>;

    /// Measure current connection quality (0.0 to 1.0).
    async fn sample_quality(&self, handle: &ConnectionHandle) -> Result<f64, GatewayError>;

    /// Hand the connection to a counselor with the given specialization.
    ///
    /// Returns the new counselor reference. The connection stays up.
    async fn transfer(
        &self,
        handle: &ConnectionHandle,
        specialization: &str,
    ) -> Result<String, GatewayError>;

    /// Tear the connection down.
    async fn hangup(&self, handle: &ConnectionHandle) -> Result<(), GatewayError>;
}
