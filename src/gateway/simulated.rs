//! Scriptable in-process gateway.
//!
//! Dial outcomes and quality samples are consumed from queues in order; once a
//! queue runs dry the gateway connects successfully and reports its default
//! quality. Every call is recorded for inspection.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{ChannelGateway, ChannelKind, ConnectionHandle, DialRequest};
use crate::error::GatewayError;

/// Scripted result for the next dial.
#[derive(Debug, Clone)]
pub enum DialScript {
    /// Connect after the configured latency.
    Connect,
    /// Fail with the given reason.
    Fail(String),
    /// Take this long before connecting.
    Delay(Duration),
}

/// A call observed by the simulated gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Dial { channel: ChannelKind, attempt: u32 },
    Send { connection_id: String, message: String },
    SampleQuality { connection_id: String },
    Transfer { connection_id: String, specialization: String },
    Hangup { connection_id: String },
}

/// In-process [`ChannelGateway`] driven by scripts.
pub struct SimulatedGateway {
    dial_script: Mutex<VecDeque<DialScript>>,
    quality_script: Mutex<VecDeque<f64>>,
    default_quality: Mutex<f64>,
    fail_transfers: AtomicBool,
    calls: Mutex<Vec<GatewayCall>>,
    next_connection: AtomicU64,
    next_counselor: AtomicU64,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self {
            dial_script: Mutex::new(VecDeque::new()),
            quality_script: Mutex::new(VecDeque::new()),
            default_quality: Mutex::new(0.9),
            fail_transfers: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            next_connection: AtomicU64::new(1),
            next_counselor: AtomicU64::new(1),
        }
    }

    /// Queue dial outcomes, consumed one per dial.
    pub fn with_dials(self, outcomes: impl IntoIterator<Item = DialScript>) -> Self {
        self.push_dials(outcomes);
        self
    }

    /// Queue quality samples, consumed one per sample.
    pub fn with_quality(self, samples: impl IntoIterator<Item = f64>) -> Self {
        self.push_quality(samples);
        self
    }

    pub fn push_dials(&self, outcomes: impl IntoIterator<Item = DialScript>) {
        lock(&self.dial_script).extend(outcomes);
    }

    pub fn push_quality(&self, samples: impl IntoIterator<Item = f64>) {
        lock(&self.quality_script).extend(samples);
    }

    /// Quality reported once the sample queue is empty.
    pub fn set_default_quality(&self, quality: f64) {
        *lock(&self.default_quality) = quality;
    }

    pub fn fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<GatewayCall> {
        lock(&self.calls).clone()
    }

    pub fn dial_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, GatewayCall::Dial { .. }))
            .count()
    }

    pub fn hangup_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, GatewayCall::Hangup { .. }))
            .count()
    }

    fn record(&self, call: GatewayCall) {
        lock(&self.calls).push(call);
    }

    fn connect(&self, channel: ChannelKind) -> ConnectionHandle {
        let connection = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let counselor = self.next_counselor.fetch_add(1, Ordering::SeqCst);
        ConnectionHandle {
            connection_id: format!("sim-{}", connection),
            channel,
            counselor_ref: Some(format!("counselor-{}", counselor)),
            initial_quality: *lock(&self.default_quality),
        }
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelGateway for SimulatedGateway {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn dial(&self, request: &DialRequest) -> Result<ConnectionHandle, GatewayError> {
        self.record(GatewayCall::Dial {
            channel: request.channel,
            attempt: request.attempt,
        });

        let script = lock(&self.dial_script)
            .pop_front()
            .unwrap_or(DialScript::Connect);

        match script {
            DialScript::Connect => Ok(self.connect(request.channel)),
            DialScript::Fail(reason) => Err(GatewayError::DialFailed {
                channel: request.channel.to_string(),
                reason,
            }),
            DialScript::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.connect(request.channel))
            }
        }
    }

    async fn send(&self, handle: &ConnectionHandle, message: &str) -> Result<(), GatewayError> {
        self.record(GatewayCall::Send {
            connection_id: handle.connection_id.clone(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn sample_quality(&self, handle: &ConnectionHandle) -> Result<f64, GatewayError> {
        self.record(GatewayCall::SampleQuality {
            connection_id: handle.connection_id.clone(),
        });
        let next = lock(&self.quality_script).pop_front();
        Ok(next.unwrap_or_else(|| *lock(&self.default_quality)))
    }

    async fn transfer(
        &self,
        handle: &ConnectionHandle,
        specialization: &str,
    ) -> Result<String, GatewayError> {
        self.record(GatewayCall::Transfer {
            connection_id: handle.connection_id.clone(),
            specialization: specialization.to_string(),
        });
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(GatewayError::TransferFailed {
                specialization: specialization.to_string(),
                reason: "no specialist available".to_string(),
            });
        }
        let counselor = self.next_counselor.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}-specialist-{}", specialization, counselor))
    }

    async fn hangup(&self, handle: &ConnectionHandle) -> Result<(), GatewayError> {
        self.record(GatewayCall::Hangup {
            connection_id: handle.connection_id.clone(),
        });
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
