//! Shared fixtures for dispatch integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use beacon_core::{Config, GeoPosition, Timestamp};
use beacon_dispatch::{
    AppendOutcome, AuthError, ClaimOutcome, CredentialRegistry, DispatchEngine, DispatchRequest,
    GatewayError, IdentityVerifier, MemoryRequestStore, MemoryResponderStore, NotificationGateway,
    NotificationPayload, ProfileInfo, RejectionOutcome, RequestKind, RequestStore,
    ResolveOutcome, ResponderClass, ResponderProfile, ResponderStore, SqliteStore, StoreError,
};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Where every test request originates
pub const CENTER: (f64, f64) = (45.0, -122.0);

/// Doctors within 2000 m of the center, in identity order
pub const NEAR_DOCTORS: [&str; 3] = ["a@doc", "b@doc", "c@doc"];

/// Gateway that records every delivery
#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<(String, NotificationPayload)>>,
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn send(
        &self,
        device_handle: &str,
        payload: &NotificationPayload,
    ) -> Result<(), GatewayError> {
        self.sent
            .lock()
            .unwrap()
            .push((device_handle.to_string(), payload.clone()));
        Ok(())
    }
}

impl RecordingGateway {
    pub fn sent(&self) -> Vec<(String, NotificationPayload)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

pub fn credential(identity: &str) -> String {
    format!("secret:{}", identity)
}

pub fn handle(identity: &str) -> String {
    format!("tok-{}", identity)
}

pub fn center() -> GeoPosition {
    GeoPosition::new(CENTER.0, CENTER.1).unwrap()
}

/// Store deadline used by [`Harness::stalling`]
pub const SHORT_TIMEOUT_MS: u64 = 100;

/// Memory request store that can be told to stall after committing.
///
/// A stalled call applies its write, then sleeps past the store deadline,
/// so the engine sees a timeout for a write that already happened.
pub struct StallingRequests {
    inner: MemoryRequestStore,
    pending: Mutex<Vec<&'static str>>,
}

impl StallingRequests {
    pub fn new() -> Self {
        Self {
            inner: MemoryRequestStore::new(),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Stall the next call of `operation` once
    pub fn stall_next(&self, operation: &'static str) {
        self.pending.lock().unwrap().push(operation);
    }

    async fn after_commit(&self, operation: &'static str) {
        let stall = {
            let mut pending = self.pending.lock().unwrap();
            match pending.iter().position(|op| *op == operation) {
                Some(i) => {
                    pending.remove(i);
                    true
                }
                None => false,
            }
        };
        if stall {
            tokio::time::sleep(Duration::from_millis(SHORT_TIMEOUT_MS * 3)).await;
        }
    }
}

#[async_trait]
impl RequestStore for StallingRequests {
    async fn create(&self, request: DispatchRequest) -> Result<String, StoreError> {
        self.inner.create(request).await
    }

    async fn get(&self, id: &str) -> Result<DispatchRequest, StoreError> {
        self.inner.get(id).await
    }

    async fn conditional_set_claimant(
        &self,
        id: &str,
        responder: &str,
        now: Timestamp,
    ) -> Result<ClaimOutcome, StoreError> {
        let outcome = self.inner.conditional_set_claimant(id, responder, now).await;
        self.after_commit("conditional_set_claimant").await;
        outcome
    }

    async fn increment_rejection(
        &self,
        id: &str,
        responder: &str,
        now: Timestamp,
    ) -> Result<RejectionOutcome, StoreError> {
        let outcome = self.inner.increment_rejection(id, responder, now).await;
        self.after_commit("increment_rejection").await;
        outcome
    }

    async fn append_candidates(
        &self,
        id: &str,
        candidates: &[String],
        now: Timestamp,
    ) -> Result<AppendOutcome, StoreError> {
        let outcome = self.inner.append_candidates(id, candidates, now).await;
        self.after_commit("append_candidates").await;
        outcome
    }

    async fn set_resolved(&self, id: &str, now: Timestamp) -> Result<ResolveOutcome, StoreError> {
        self.inner.set_resolved(id, now).await
    }

    async fn list_by_requester(
        &self,
        kind: RequestKind,
        identity: &str,
    ) -> Result<Vec<DispatchRequest>, StoreError> {
        self.inner.list_by_requester(kind, identity).await
    }

    async fn list_by_candidate(
        &self,
        kind: RequestKind,
        identity: &str,
    ) -> Result<Vec<DispatchRequest>, StoreError> {
        self.inner.list_by_candidate(kind, identity).await
    }
}

/// Verifier whose first `failures` enrollments report the backend as down
pub struct FlakyEnrollment {
    registry: Arc<CredentialRegistry>,
    failures: AtomicU32,
}

#[async_trait]
impl IdentityVerifier for FlakyEnrollment {
    async fn verify(
        &self,
        class: ResponderClass,
        identity: &str,
        credential: &str,
    ) -> Result<(), AuthError> {
        self.registry.verify(class, identity, credential).await
    }

    async fn enroll(
        &self,
        class: ResponderClass,
        identity: &str,
        credential: &str,
    ) -> Result<(), AuthError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(AuthError::Unavailable("verifier timed out".to_string()));
        }
        self.registry.enroll(class, identity, credential).await
    }
}

pub struct Harness {
    pub engine: Arc<DispatchEngine>,
    pub registry: Arc<CredentialRegistry>,
    pub gateway: Arc<RecordingGateway>,
    pub profiles: Arc<dyn ResponderStore>,
    pub requests: Arc<dyn RequestStore>,
}

impl Harness {
    pub fn memory() -> Self {
        Self::build(
            Arc::new(MemoryResponderStore::new()),
            Arc::new(MemoryRequestStore::new()),
        )
    }

    pub fn sqlite(path: &Path) -> Self {
        let store = Arc::new(SqliteStore::open(path).unwrap());
        Self::build(store.clone(), store)
    }

    /// Memory stores with a short store deadline; the returned handle
    /// controls which request-store writes stall after committing
    pub fn stalling() -> (Self, Arc<StallingRequests>) {
        let requests = Arc::new(StallingRequests::new());
        let mut config = Config::default_config();
        config.store.timeout_ms = SHORT_TIMEOUT_MS;
        config.store.base_backoff_ms = 10;
        config.store.max_backoff_ms = 20;

        let registry = Arc::new(CredentialRegistry::new());
        let harness = Self::build_with(
            &config,
            Arc::new(MemoryResponderStore::new()),
            requests.clone(),
            registry.clone(),
            registry,
        );
        (harness, requests)
    }

    /// Memory stores behind a verifier that fails its first `failures`
    /// enrollments
    pub fn flaky_enrollment(failures: u32) -> Self {
        let registry = Arc::new(CredentialRegistry::new());
        let verifier = Arc::new(FlakyEnrollment {
            registry: registry.clone(),
            failures: AtomicU32::new(failures),
        });
        Self::build_with(
            &Config::default_config(),
            Arc::new(MemoryResponderStore::new()),
            Arc::new(MemoryRequestStore::new()),
            registry,
            verifier,
        )
    }

    fn build(profiles: Arc<dyn ResponderStore>, requests: Arc<dyn RequestStore>) -> Self {
        let registry = Arc::new(CredentialRegistry::new());
        Self::build_with(
            &Config::default_config(),
            profiles,
            requests,
            registry.clone(),
            registry,
        )
    }

    fn build_with(
        config: &Config,
        profiles: Arc<dyn ResponderStore>,
        requests: Arc<dyn RequestStore>,
        registry: Arc<CredentialRegistry>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        beacon_core::logging::try_init_for_tests();

        let gateway = Arc::new(RecordingGateway::default());
        let engine = DispatchEngine::new(
            config,
            profiles.clone(),
            requests.clone(),
            verifier,
            gateway.clone(),
        )
        .unwrap();

        Self {
            engine: Arc::new(engine),
            registry,
            gateway,
            profiles,
            requests,
        }
    }

    /// Store a profile and its credential; handle `None` means no device
    pub async fn add(
        &self,
        class: ResponderClass,
        identity: &str,
        position: Option<(f64, f64)>,
        device: Option<&str>,
    ) {
        let mut profile = ResponderProfile::new(identity, class, 0).with_info(ProfileInfo {
            name: Some(identity.to_uppercase()),
            phone: Some("555-0100".to_string()),
            designation: None,
        });
        if let Some((lat, lon)) = position {
            profile = profile.with_position(GeoPosition::new(lat, lon).unwrap());
        }
        if let Some(device) = device {
            profile = profile.with_device_handle(device);
        }
        self.profiles.put(profile).await.unwrap();
        self.registry.register(class, identity, &credential(identity));
    }

    /// Standard fixture around [`CENTER`]
    ///
    /// Distances from the center: a 556 m, b 1112 m, c 1180 m,
    /// corner 2290 m (inside the 2000 m box, outside the circle),
    /// d 5560 m, e 22 km. `nowhere` has no position.
    pub async fn seed(&self) {
        let (lat, lon) = CENTER;
        let doctors = [
            ("a@doc", Some((lat + 0.005, lon))),
            ("b@doc", Some((lat + 0.01, lon))),
            ("c@doc", Some((lat, lon + 0.015))),
            ("corner@doc", Some((lat + 0.015, lon + 0.02))),
            ("d@doc", Some((lat + 0.05, lon))),
            ("e@doc", Some((lat + 0.2, lon))),
            ("nowhere@doc", None),
        ];
        for (identity, position) in doctors {
            self.add(ResponderClass::Doctor, identity, position, Some(&handle(identity)))
                .await;
        }

        self.add(ResponderClass::Transit, "t1@van", Some((lat + 0.002, lon)), Some(&handle("t1@van")))
            .await;
        self.add(ResponderClass::Transit, "t2@van", Some((lat + 0.3, lon)), Some(&handle("t2@van")))
            .await;

        self.add(ResponderClass::Client, "alice@client", None, Some(&handle("alice@client")))
            .await;
        self.add(ResponderClass::Client, "bob@client", None, Some("null"))
            .await;
    }

    /// Wait for queued notifications to finish
    pub async fn settle(&self) {
        self.engine.notifier().wait_idle().await;
    }

    pub fn sent(&self) -> Vec<(String, NotificationPayload)> {
        self.gateway.sent()
    }

    /// Sorted device handles that received a notification with `title`
    pub fn recipients(&self, title: &str) -> Vec<String> {
        let mut handles: Vec<String> = self
            .sent()
            .into_iter()
            .filter(|(_, payload)| payload.title() == title)
            .map(|(handle, _)| handle)
            .collect();
        handles.sort();
        handles
    }

    /// Sorted device handles that received exactly this payload variant
    pub fn recipients_of<F>(&self, matches: F) -> Vec<String>
    where
        F: Fn(&NotificationPayload) -> bool,
    {
        let mut handles: Vec<String> = self
            .sent()
            .into_iter()
            .filter(|(_, payload)| matches(payload))
            .map(|(handle, _)| handle)
            .collect();
        handles.sort();
        handles
    }

    pub async fn profile(&self, class: ResponderClass, identity: &str) -> ResponderProfile {
        self.profiles.get(class, identity).await.unwrap()
    }

    /// SOS from alice at the center
    pub async fn sos(&self, radius_m: f64) -> beacon_dispatch::DispatchRequest {
        self.engine
            .create_sos(
                "alice@client",
                &credential("alice@client"),
                center(),
                "fell down the stairs",
                radius_m,
            )
            .await
            .unwrap()
    }
}

pub fn handles(identities: &[&str]) -> Vec<String> {
    let mut handles: Vec<String> = identities.iter().map(|id| handle(id)).collect();
    handles.sort();
    handles
}
