//! Beacon proximity dispatch and resolution engine
//!
//! Matches emergency requests to nearby responders and drives each request
//! through broadcast, escalation, claim or decline, and resolution.
//!
//! # Architecture
//!
//! - [`geofence`]: radius to bounding box on a spherical Earth
//! - [`directory`]: box query plus exact great-circle filter
//! - [`ledger`]: offered/accepted counters per responder
//! - [`notify`]: bounded queue and worker pool in front of the push gateway
//! - [`engine`]: the request state machine tying the above together
//! - [`store`]: persistence traits with in-memory and SQLite backends
//!
//! Every store call runs under the [`retry::RetryPolicy`] deadline and
//! backoff. Correctness under concurrency comes from conditional store
//! updates, never from in-process locks.

pub mod auth;
pub mod directory;
pub mod engine;
pub mod error;
pub mod geofence;
pub mod ledger;
pub mod notify;
pub mod profile;
pub mod retry;
pub mod store;
pub mod types;

pub use auth::{AuthError, CredentialRegistry, IdentityVerifier};
pub use directory::{CandidateDirectory, NearbyResponders};
pub use engine::{DeclineAck, DispatchEngine};
pub use error::{DispatchError, StoreError};
pub use geofence::{BoundingBox, Geofence, GeofenceError};
pub use ledger::CounterLedger;
pub use notify::{
    GatewayError, NotificationCoordinator, NotificationGateway, NotificationMetrics,
    NotificationPayload, NO_DEVICE_SENTINEL,
};
pub use retry::RetryPolicy;
pub use store::{
    AppendOutcome, ClaimOutcome, MemoryRequestStore, MemoryResponderStore, RejectionOutcome,
    RequestStore, ResolveOutcome, ResponderStore, SqliteStore,
};
pub use types::{
    CounterField, DispatchRequest, ProfileFields, ProfileInfo, RequestKind, RequestState,
    ResponderClass, ResponderProfile, SanitizedProfile,
};
