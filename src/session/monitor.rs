//! Connection quality monitoring.
//!
//! One background task per connected session samples quality from the
//! gateway on a fixed interval and reports each sample to a [`MonitorSink`]
//! (the orchestrator), which owns every state decision. The monitor only
//! handles timing and cancellation.
//!
//! ```text
//! session connected   --> attach(session, handle, token)
//! every interval      --> gateway.sample_quality (bounded) --> sink.quality_sampled
//! sink says reconnect --> sleep(reconnect_delay) --> sink.reconnect
//! session ends        --> token cancelled --> task exits
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::gateway::{ChannelGateway, ConnectionHandle};

/// What the monitor should do after a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorDirective {
    /// Keep sampling.
    Continue,
    /// Wait the reconnect delay, then ask the sink to reconnect.
    Reconnect,
    /// The session is gone; stop.
    Stop,
}

/// Receives samples and performs reconnects on the monitor's behalf.
#[async_trait]
pub trait MonitorSink: Send + Sync {
    async fn quality_sampled(&self, session_id: Uuid, quality: f64) -> MonitorDirective;

    /// Re-establish the connection. `None` means the session has ended.
    async fn reconnect(&self, session_id: Uuid) -> Option<ConnectionHandle>;
}

/// Spawns and tracks per-session sampling tasks.
pub struct ConnectionMonitor {
    gateway: Arc<dyn ChannelGateway>,
    sampling_interval: Duration,
    reconnect_delay: Duration,
    sample_timeout: Duration,
    attached: Arc<Mutex<HashMap<Uuid, Attachment>>>,
    next_generation: AtomicU64,
}

struct Attachment {
    generation: u64,
    token: CancellationToken,
}

impl ConnectionMonitor {
    /// A sample that takes longer than `sample_timeout` counts as poor.
    pub fn new(
        gateway: Arc<dyn ChannelGateway>,
        sampling_interval: Duration,
        reconnect_delay: Duration,
        sample_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            sampling_interval,
            reconnect_delay,
            sample_timeout,
            attached: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start sampling a session until `detach` or until `parent` is cancelled.
    pub fn attach(
        &self,
        session_id: Uuid,
        handle: ConnectionHandle,
        parent: &CancellationToken,
        sink: Arc<dyn MonitorSink>,
    ) -> JoinHandle<()> {
        let token = parent.child_token();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let attachment = Attachment {
            generation,
            token: token.clone(),
        };
        if let Some(previous) = lock(&self.attached).insert(session_id, attachment) {
            previous.token.cancel();
        }

        tracing::debug!(
            session_id = %session_id,
            interval_ms = self.sampling_interval.as_millis() as u64,
            "Connection monitor attached"
        );

        let sampler = Sampler {
            session_id,
            gateway: Arc::clone(&self.gateway),
            sink,
            token,
            sampling_interval: self.sampling_interval,
            reconnect_delay: self.reconnect_delay,
            sample_timeout: self.sample_timeout,
        };
        let attached = Arc::clone(&self.attached);

        tokio::spawn(async move {
            sampler.run(handle).await;
            let mut attached = lock(&attached);
            // A re-attach may have replaced our entry.
            if attached
                .get(&session_id)
                .is_some_and(|a| a.generation == generation)
            {
                attached.remove(&session_id);
            }
        })
    }

    /// Stop sampling a session. Returns `false` if it was not attached.
    pub fn detach(&self, session_id: Uuid) -> bool {
        match lock(&self.attached).remove(&session_id) {
            Some(attachment) => {
                attachment.token.cancel();
                tracing::debug!(session_id = %session_id, "Connection monitor detached");
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self, session_id: Uuid) -> bool {
        lock(&self.attached)
            .get(&session_id)
            .is_some_and(|a| !a.token.is_cancelled())
    }

    /// Number of sessions currently sampled.
    pub fn attached_count(&self) -> usize {
        lock(&self.attached)
            .values()
            .filter(|a| !a.token.is_cancelled())
            .count()
    }
}

struct Sampler {
    session_id: Uuid,
    gateway: Arc<dyn ChannelGateway>,
    sink: Arc<dyn MonitorSink>,
    token: CancellationToken,
    sampling_interval: Duration,
    reconnect_delay: Duration,
    sample_timeout: Duration,
}

impl Sampler {
    async fn run(&self, mut handle: ConnectionHandle) {
        let mut ticker = tokio::time::interval(self.sampling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; sample one interval in.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sample = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                sample = tokio::time::timeout(
                    self.sample_timeout,
                    self.gateway.sample_quality(&handle),
                ) => sample,
            };
            let quality = match sample {
                Ok(Ok(q)) => q.clamp(0.0, 1.0),
                Ok(Err(e)) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "Quality sample failed; treating as poor"
                    );
                    0.0
                }
                Err(_) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        timeout_ms = self.sample_timeout.as_millis() as u64,
                        "Quality sample timed out; treating as poor"
                    );
                    0.0
                }
            };

            match self.sink.quality_sampled(self.session_id, quality).await {
                MonitorDirective::Continue => {}
                MonitorDirective::Stop => break,
                MonitorDirective::Reconnect => {
                    tracing::info!(
                        session_id = %self.session_id,
                        delay_ms = self.reconnect_delay.as_millis() as u64,
                        "Scheduling automatic reconnect"
                    );
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                    match self.sink.reconnect(self.session_id).await {
                        Some(new_handle) => {
                            handle = new_handle;
                            ticker.reset();
                        }
                        None => break,
                    }
                }
            }
        }

        tracing::debug!(session_id = %self.session_id, "Connection monitor stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::{ChannelKind, DialRequest, SimulatedGateway};

    struct RecordingSink {
        samples: Mutex<Vec<f64>>,
        directives: Mutex<Vec<MonitorDirective>>,
        reconnects: AtomicUsize,
        reconnect_result: Option<ConnectionHandle>,
    }

    impl RecordingSink {
        fn new(directives: Vec<MonitorDirective>, reconnect_result: Option<ConnectionHandle>) -> Self {
            Self {
                samples: Mutex::new(Vec::new()),
                directives: Mutex::new(directives),
                reconnects: AtomicUsize::new(0),
                reconnect_result,
            }
        }
    }

    #[async_trait]
    impl MonitorSink for RecordingSink {
        async fn quality_sampled(&self, _session_id: Uuid, quality: f64) -> MonitorDirective {
            self.samples.lock().unwrap().push(quality);
            let mut directives = self.directives.lock().unwrap();
            if directives.is_empty() {
                MonitorDirective::Continue
            } else {
                directives.remove(0)
            }
        }

        async fn reconnect(&self, _session_id: Uuid) -> Option<ConnectionHandle> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            self.reconnect_result.clone()
        }
    }

    /// Gateway whose quality samples never complete.
    struct StalledGateway;

    #[async_trait]
    impl ChannelGateway for StalledGateway {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn dial(&self, request: &DialRequest) -> Result<ConnectionHandle, GatewayError> {
            Err(GatewayError::DialFailed {
                channel: request.channel.to_string(),
                reason: "stalled".to_string(),
            })
        }

        async fn send(&self, _handle: &ConnectionHandle, _message: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn sample_quality(&self, _handle: &ConnectionHandle) -> Result<f64, GatewayError> {
            std::future::pending().await
        }

        async fn transfer(
            &self,
            _handle: &ConnectionHandle,
            specialization: &str,
        ) -> Result<String, GatewayError> {
            Err(GatewayError::TransferFailed {
                specialization: specialization.to_string(),
                reason: "stalled".to_string(),
            })
        }

        async fn hangup(&self, _handle: &ConnectionHandle) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    fn handle(id: &str) -> ConnectionHandle {
        ConnectionHandle {
            connection_id: id.to_string(),
            channel: ChannelKind::Voice,
            counselor_ref: None,
            initial_quality: 0.9,
        }
    }

    fn monitor(gateway: Arc<SimulatedGateway>) -> ConnectionMonitor {
        ConnectionMonitor::new(
            gateway,
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_millis(20),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_each_interval_until_detached() {
        let gateway = Arc::new(SimulatedGateway::new().with_quality([0.8, 0.7, 0.6]));
        let monitor = monitor(Arc::clone(&gateway));
        let sink = Arc::new(RecordingSink::new(Vec::new(), None));
        let root = CancellationToken::new();
        let id = Uuid::new_v4();

        let task = monitor.attach(id, handle("c-1"), &root, sink.clone());
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(monitor.is_attached(id));

        assert!(monitor.detach(id));
        task.await.unwrap();

        assert_eq!(*sink.samples.lock().unwrap(), vec![0.8, 0.7, 0.6]);
        assert!(!monitor.is_attached(id));
        assert_eq!(monitor.attached_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_stops_sampling() {
        let gateway = Arc::new(SimulatedGateway::new());
        let monitor = monitor(gateway);
        let sink = Arc::new(RecordingSink::new(Vec::new(), None));
        let root = CancellationToken::new();

        let task = monitor.attach(Uuid::new_v4(), handle("c-1"), &root, sink.clone());
        tokio::time::sleep(Duration::from_millis(25)).await;
        root.cancel();
        task.await.unwrap();

        let taken = sink.samples.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.samples.lock().unwrap().len(), taken);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_directive_ends_task() {
        let gateway = Arc::new(SimulatedGateway::new());
        let monitor = monitor(gateway);
        let sink = Arc::new(RecordingSink::new(vec![MonitorDirective::Stop], None));
        let root = CancellationToken::new();
        let id = Uuid::new_v4();

        monitor.attach(id, handle("c-1"), &root, sink.clone()).await.unwrap();

        assert_eq!(sink.samples.lock().unwrap().len(), 1);
        assert!(!monitor.is_attached(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_swaps_handle_and_keeps_sampling() {
        let gateway = Arc::new(SimulatedGateway::new());
        let monitor = monitor(Arc::clone(&gateway));
        let sink = Arc::new(RecordingSink::new(
            vec![MonitorDirective::Reconnect, MonitorDirective::Stop],
            Some(handle("c-2")),
        ));
        let root = CancellationToken::new();

        monitor
            .attach(Uuid::new_v4(), handle("c-1"), &root, sink.clone())
            .await
            .unwrap();

        assert_eq!(sink.reconnects.load(Ordering::SeqCst), 1);
        let sampled: Vec<String> = gateway
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                crate::gateway::GatewayCall::SampleQuality { connection_id } => Some(connection_id),
                _ => None,
            })
            .collect();
        assert_eq!(sampled, vec!["c-1".to_string(), "c-2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_stops_task() {
        let gateway = Arc::new(SimulatedGateway::new());
        let monitor = monitor(gateway);
        let sink = Arc::new(RecordingSink::new(vec![MonitorDirective::Reconnect], None));
        let root = CancellationToken::new();

        monitor
            .attach(Uuid::new_v4(), handle("c-1"), &root, sink.clone())
            .await
            .unwrap();

        assert_eq!(sink.reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(sink.samples.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sample_counts_as_poor() {
        let gateway = Arc::new(StalledGateway);
        let monitor = ConnectionMonitor::new(
            gateway,
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_millis(20),
        );
        let sink = Arc::new(RecordingSink::new(Vec::new(), None));
        let root = CancellationToken::new();
        let id = Uuid::new_v4();

        monitor.attach(id, handle("c-1"), &root, sink.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let samples = sink.samples.lock().unwrap().clone();
        assert!(samples.len() >= 2);
        assert!(samples.iter().all(|q| *q == 0.0));
        assert!(monitor.detach(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_interrupts_stalled_sample() {
        let gateway = Arc::new(StalledGateway);
        let monitor = ConnectionMonitor::new(
            gateway.clone(),
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_secs(24 * 3600),
        );
        let sink = Arc::new(RecordingSink::new(Vec::new(), None));
        let root = CancellationToken::new();
        let id = Uuid::new_v4();

        let task = monitor.attach(id, handle("c-1"), &root, sink.clone());
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(Arc::strong_count(&gateway), 3);

        assert!(monitor.detach(id));
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(sink.samples.lock().unwrap().is_empty());
        // Only the test and the monitor still hold the gateway.
        assert_eq!(Arc::strong_count(&gateway), 2);
    }
}
