//! Notification coordinator
//!
//! Jobs go onto a bounded queue drained by a dispatcher task, which hands
//! each one to a worker while a semaphore permit is available. Callers only
//! ever `try_send`, so a slow or failing gateway cannot stall a dispatch
//! operation. Delivery failures, timeouts and a full queue are counted and
//! logged, never returned.

use async_trait::async_trait;
use beacon_core::{GeoPosition, NotificationConfig};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, error, warn};

use crate::retry::RetryPolicy;
use crate::store::ResponderStore;
use crate::types::{RequestKind, ResponderClass, SanitizedProfile};

/// Device handle value meaning "no device registered"
pub const NO_DEVICE_SENTINEL: &str = "null";

/// Typed notification body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum NotificationPayload {
    /// A new request is offered to a responder
    Offer {
        request_id: String,
        request_kind: RequestKind,
        origin: GeoPosition,
        note: String,
    },
    /// Tells the requester who claimed the request
    Accepted {
        request_id: String,
        claimant: SanitizedProfile,
    },
    /// Tells other candidates that someone else claimed the request
    ResolvedByOther { request_id: String },
    /// Tells candidates the requester closed the request
    Resolved { request_id: String },
    /// Tells the requester every candidate declined
    Exhausted {
        request_id: String,
        rejection_count: u32,
        candidate_count: u32,
    },
}

impl NotificationPayload {
    /// Notification title understood by responder devices
    pub fn title(&self) -> &'static str {
        match self {
            NotificationPayload::Offer { .. } => "sos",
            NotificationPayload::Accepted { .. } => "accept",
            NotificationPayload::ResolvedByOther { .. } | NotificationPayload::Resolved { .. } => {
                "resolved"
            }
            NotificationPayload::Exhausted { .. } => "rejection",
        }
    }

    /// Request this notification is about
    pub fn request_id(&self) -> &str {
        match self {
            NotificationPayload::Offer { request_id, .. }
            | NotificationPayload::Accepted { request_id, .. }
            | NotificationPayload::ResolvedByOther { request_id }
            | NotificationPayload::Resolved { request_id }
            | NotificationPayload::Exhausted { request_id, .. } => request_id,
        }
    }
}

/// Push delivery failures
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Gateway refused the message
    #[error("Delivery rejected: {0}")]
    Rejected(String),

    /// Gateway could not be reached
    #[error("Gateway unreachable: {0}")]
    Unreachable(String),
}

/// External push delivery
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Deliver `payload` to the device behind `device_handle`
    async fn send(
        &self,
        device_handle: &str,
        payload: &NotificationPayload,
    ) -> Result<(), GatewayError>;
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationMetrics {
    /// Accepted by the gateway
    pub delivered: u64,
    /// Gateway error, timeout or failed profile lookup
    pub failed: u64,
    /// No usable device handle
    pub skipped: u64,
    /// Queue full
    pub dropped: u64,
}

enum Job {
    Deliver {
        handle: String,
        payload: NotificationPayload,
    },
    Lookup {
        class: ResponderClass,
        identities: Vec<String>,
        payload: NotificationPayload,
    },
}

struct Shared {
    gateway: Arc<dyn NotificationGateway>,
    profiles: Arc<dyn ResponderStore>,
    retry: RetryPolicy,
    send_timeout: Duration,
    in_flight: AtomicUsize,
    idle: Notify,
    delivered: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
}

fn usable_handle(handle: Option<&str>) -> Option<&str> {
    handle.filter(|h| !h.is_empty() && *h != NO_DEVICE_SENTINEL)
}

impl Shared {
    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn execute(&self, job: Job) {
        match job {
            Job::Deliver { handle, payload } => self.deliver(&handle, &payload).await,
            Job::Lookup {
                class,
                identities,
                payload,
            } => {
                let payload = &payload;
                let lookups = identities
                    .iter()
                    .map(|identity| self.lookup_and_deliver(class, identity, payload));
                join_all(lookups).await;
            }
        }
    }

    async fn lookup_and_deliver(
        &self,
        class: ResponderClass,
        identity: &str,
        payload: &NotificationPayload,
    ) {
        let profile = match self
            .retry
            .run("get_profile", || self.profiles.get(class, identity))
            .await
        {
            Ok(profile) => profile,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    class = %class,
                    identity,
                    request_id = payload.request_id(),
                    error = %e,
                    "Device handle lookup failed"
                );
                return;
            }
        };

        match usable_handle(profile.device_handle.as_deref()) {
            Some(handle) => self.deliver(handle, payload).await,
            None => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(identity, "No device registered, notification skipped");
            }
        }
    }

    async fn deliver(&self, handle: &str, payload: &NotificationPayload) {
        match tokio::time::timeout(self.send_timeout, self.gateway.send(handle, payload)).await {
            Ok(Ok(())) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    title = payload.title(),
                    request_id = payload.request_id(),
                    "Notification delivered"
                );
            }
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    title = payload.title(),
                    request_id = payload.request_id(),
                    error = %e,
                    "Notification delivery failed"
                );
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    title = payload.title(),
                    request_id = payload.request_id(),
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "Notification delivery timed out"
                );
            }
        }
    }
}

/// Fire-and-forget notification fan-out through a bounded worker pool
#[derive(Clone)]
pub struct NotificationCoordinator {
    tx: mpsc::Sender<Job>,
    shared: Arc<Shared>,
}

impl NotificationCoordinator {
    /// Start the dispatcher task. Must be called within a Tokio runtime.
    pub fn new(
        gateway: Arc<dyn NotificationGateway>,
        profiles: Arc<dyn ResponderStore>,
        retry: RetryPolicy,
        config: &NotificationConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            gateway,
            profiles,
            retry,
            send_timeout: config.send_timeout(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        tokio::spawn(Self::dispatch(rx, shared.clone(), workers));

        Self { tx, shared }
    }

    async fn dispatch(mut rx: mpsc::Receiver<Job>, shared: Arc<Shared>, workers: Arc<Semaphore>) {
        while let Some(job) = rx.recv().await {
            let permit = match workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Notification worker pool closed");
                    shared.finish();
                    break;
                }
            };
            let shared = shared.clone();
            tokio::spawn(async move {
                shared.execute(job).await;
                drop(permit);
                shared.finish();
            });
        }
        debug!("Notification dispatcher stopped");
    }

    fn enqueue(&self, job: Job) {
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.tx.try_send(job) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Notification queue rejected job");
            self.shared.finish();
        }
    }

    /// Send `payload` to a known device handle; absent or sentinel handles
    /// are skipped
    pub fn notify(&self, device_handle: Option<&str>, payload: NotificationPayload) {
        match usable_handle(device_handle) {
            Some(handle) => self.enqueue(Job::Deliver {
                handle: handle.to_string(),
                payload,
            }),
            None => {
                self.shared.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    title = payload.title(),
                    request_id = payload.request_id(),
                    "No device registered, notification skipped"
                );
            }
        }
    }

    /// Look up the identity's device handle in the background, then send
    pub fn notify_identity(&self, class: ResponderClass, identity: &str, payload: NotificationPayload) {
        self.fan_out(class, vec![identity.to_string()], payload);
    }

    /// Send the same payload to every identity; lookups run in parallel and
    /// fail independently
    pub fn fan_out(&self, class: ResponderClass, identities: Vec<String>, payload: NotificationPayload) {
        if identities.is_empty() {
            return;
        }
        self.enqueue(Job::Lookup {
            class,
            identities,
            payload,
        });
    }

    /// Wait until every queued job has finished
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Snapshot of delivery counters
    pub fn metrics(&self) -> NotificationMetrics {
        NotificationMetrics {
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            skipped: self.shared.skipped.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryResponderStore;
    use crate::types::ResponderProfile;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<(String, NotificationPayload)>>,
    }

    #[async_trait]
    impl NotificationGateway for RecordingGateway {
        async fn send(
            &self,
            device_handle: &str,
            payload: &NotificationPayload,
        ) -> Result<(), GatewayError> {
            if device_handle == "bad-token" {
                return Err(GatewayError::Rejected("unregistered".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((device_handle.to_string(), payload.clone()));
            Ok(())
        }
    }

    struct StalledGateway;

    #[async_trait]
    impl NotificationGateway for StalledGateway {
        async fn send(&self, _: &str, _: &NotificationPayload) -> Result<(), GatewayError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(())
        }
    }

    fn config(workers: usize, queue_capacity: usize) -> NotificationConfig {
        NotificationConfig {
            workers,
            queue_capacity,
            send_timeout_ms: 100,
        }
    }

    fn resolved(id: &str) -> NotificationPayload {
        NotificationPayload::Resolved {
            request_id: id.to_string(),
        }
    }

    async fn profiles() -> Arc<MemoryResponderStore> {
        let store = MemoryResponderStore::new();
        store
            .put(ResponderProfile::new("a@x", ResponderClass::Doctor, 0).with_device_handle("tok-a"))
            .await
            .unwrap();
        store
            .put(ResponderProfile::new("b@x", ResponderClass::Doctor, 0).with_device_handle("null"))
            .await
            .unwrap();
        store
            .put(ResponderProfile::new("c@x", ResponderClass::Doctor, 0).with_device_handle("bad-token"))
            .await
            .unwrap();
        store
            .put(ResponderProfile::new("d@x", ResponderClass::Doctor, 0).with_device_handle("tok-d"))
            .await
            .unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_payload_titles_and_shape() {
        let payload = NotificationPayload::Exhausted {
            request_id: "req-1".to_string(),
            rejection_count: 3,
            candidate_count: 3,
        };
        assert_eq!(payload.title(), "rejection");
        assert_eq!(resolved("r").title(), "resolved");

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "exhausted");
        assert_eq!(json["body"]["request_id"], "req-1");
        assert_eq!(json["body"]["candidate_count"], 3);
    }

    #[tokio::test]
    async fn test_sentinel_and_absent_handles_are_skipped() {
        let gateway = Arc::new(RecordingGateway::default());
        let coordinator = NotificationCoordinator::new(
            gateway.clone(),
            profiles().await,
            RetryPolicy::default(),
            &config(2, 8),
        );

        coordinator.notify(None, resolved("req-1"));
        coordinator.notify(Some(NO_DEVICE_SENTINEL), resolved("req-1"));
        coordinator.notify(Some("tok-z"), resolved("req-1"));
        coordinator.wait_idle().await;

        let sent = gateway.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("tok-z".to_string(), resolved("req-1"))]);
        assert_eq!(coordinator.metrics().skipped, 2);
    }

    #[tokio::test]
    async fn test_fan_out_isolates_failures() {
        let gateway = Arc::new(RecordingGateway::default());
        let coordinator = NotificationCoordinator::new(
            gateway.clone(),
            profiles().await,
            RetryPolicy::default(),
            &config(2, 8),
        );

        let recipients = ["a@x", "b@x", "c@x", "d@x", "missing@x"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        coordinator.fan_out(ResponderClass::Doctor, recipients, resolved("req-1"));
        coordinator.wait_idle().await;

        let mut handles: Vec<String> = gateway
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(h, _)| h.clone())
            .collect();
        handles.sort();
        assert_eq!(handles, vec!["tok-a", "tok-d"]);

        let metrics = coordinator.metrics();
        assert_eq!(metrics.delivered, 2);
        assert_eq!(metrics.skipped, 1);
        // bad-token rejection plus missing profile
        assert_eq!(metrics.failed, 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let gateway = Arc::new(RecordingGateway::default());
        let coordinator = NotificationCoordinator::new(
            gateway.clone(),
            profiles().await,
            RetryPolicy::default(),
            &config(1, 1),
        );

        // Current-thread runtime: the dispatcher cannot drain between sends
        coordinator.notify(Some("tok-1"), resolved("req-1"));
        coordinator.notify(Some("tok-2"), resolved("req-2"));
        coordinator.notify(Some("tok-3"), resolved("req-3"));
        coordinator.wait_idle().await;

        assert_eq!(coordinator.metrics().dropped, 2);
        assert_eq!(gateway.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_gateway_times_out() {
        let coordinator = NotificationCoordinator::new(
            Arc::new(StalledGateway),
            profiles().await,
            RetryPolicy::default(),
            &config(1, 4),
        );

        coordinator.notify(Some("tok-a"), resolved("req-1"));
        coordinator.wait_idle().await;

        assert_eq!(coordinator.metrics().failed, 1);
        assert_eq!(coordinator.metrics().delivered, 0);
    }
}
