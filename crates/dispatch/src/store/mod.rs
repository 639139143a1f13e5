//! Persistence boundary
//!
//! Two async traits cover everything the engine persists. Implementations
//! must make each method atomic per key: the engine relies on
//! `conditional_set_claimant`, `increment_rejection` and `append_candidates`
//! deciding their outcome against the persisted row, never against a copy
//! the caller read earlier. Each of those is safe to repeat: a second call
//! with the same arguments reports the first call's effect instead of
//! applying it again.

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryRequestStore, MemoryResponderStore};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use beacon_core::{GeoPosition, Timestamp};

use crate::error::StoreError;
use crate::geofence::BoundingBox;
use crate::types::{
    CounterField, DispatchRequest, ProfileFields, RequestKind, ResponderClass, ResponderProfile,
};

/// Result of a conditional claim
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Claimant was unset and is now the caller
    Claimed(DispatchRequest),
    /// Caller already held the claim; nothing written
    HeldByCaller(DispatchRequest),
    /// Someone else holds the claim
    AlreadyClaimed {
        /// Current holder
        claimant: String,
        /// Persisted request
        request: DispatchRequest,
    },
    /// Request was resolved before anyone claimed it
    Resolved(DispatchRequest),
}

/// Result of recording a decline
#[derive(Debug, Clone, PartialEq)]
pub enum RejectionOutcome {
    /// Responder added to the decliners and the count incremented
    Counted(DispatchRequest),
    /// Responder had already declined; count untouched
    AlreadyDeclined(DispatchRequest),
    /// Responder is not a candidate; count untouched
    NotCandidate(DispatchRequest),
    /// Request has a claimant; count untouched
    Claimed(DispatchRequest),
    /// Request is resolved; count untouched
    Resolved(DispatchRequest),
}

/// Result of a candidate merge
#[derive(Debug, Clone, PartialEq)]
pub struct AppendOutcome {
    /// Request after the merge
    pub request: DispatchRequest,
    /// Identities that were not already candidates, in input order
    pub added: Vec<String>,
}

/// Result of a resolve
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// This call flipped the flag
    Resolved(DispatchRequest),
    /// Flag was already set
    AlreadyResolved(DispatchRequest),
}

/// Responder profiles keyed by (class, identity)
#[async_trait]
pub trait ResponderStore: Send + Sync {
    /// Insert or replace a profile
    async fn put(&self, profile: ResponderProfile) -> Result<(), StoreError>;

    /// Insert a profile unless one exists for its (class, identity).
    /// Returns the persisted profile, which equals `profile` only if this
    /// call (or an earlier attempt of it) inserted it.
    async fn insert(&self, profile: ResponderProfile) -> Result<ResponderProfile, StoreError>;

    /// Delete a profile; deleting a missing profile succeeds
    async fn remove(&self, class: ResponderClass, identity: &str) -> Result<(), StoreError>;

    /// Fetch a profile
    async fn get(
        &self,
        class: ResponderClass,
        identity: &str,
    ) -> Result<ResponderProfile, StoreError>;

    /// Identities and positions inside `bbox` (inclusive), ordered by identity
    async fn find_in_box(
        &self,
        class: ResponderClass,
        bbox: &BoundingBox,
    ) -> Result<Vec<(String, GeoPosition)>, StoreError>;

    /// Atomically add `delta` to a counter and return the updated profile
    async fn increment(
        &self,
        class: ResponderClass,
        identity: &str,
        field: CounterField,
        delta: u64,
        now: Timestamp,
    ) -> Result<ResponderProfile, StoreError>;

    /// Overwrite the given fields and return the updated profile
    async fn set_fields(
        &self,
        class: ResponderClass,
        identity: &str,
        fields: ProfileFields,
        now: Timestamp,
    ) -> Result<ResponderProfile, StoreError>;
}

/// Dispatch requests keyed by id
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new request; a second call with the same id returns the id
    /// without overwriting
    async fn create(&self, request: DispatchRequest) -> Result<String, StoreError>;

    /// Fetch a request
    async fn get(&self, id: &str) -> Result<DispatchRequest, StoreError>;

    /// Set the claimant only if it is unset and the request is open
    async fn conditional_set_claimant(
        &self,
        id: &str,
        responder: &str,
        now: Timestamp,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Record that `responder` declined. Counts at most once per candidate,
    /// and never once the request is claimed or resolved.
    async fn increment_rejection(
        &self,
        id: &str,
        responder: &str,
        now: Timestamp,
    ) -> Result<RejectionOutcome, StoreError>;

    /// Merge `candidates` into the candidate set; the diff is computed
    /// against the persisted set. Resolved requests are returned unchanged.
    async fn append_candidates(
        &self,
        id: &str,
        candidates: &[String],
        now: Timestamp,
    ) -> Result<AppendOutcome, StoreError>;

    /// Set the resolved flag
    async fn set_resolved(&self, id: &str, now: Timestamp) -> Result<ResolveOutcome, StoreError>;

    /// Requests of `kind` raised by `identity`, oldest first
    async fn list_by_requester(
        &self,
        kind: RequestKind,
        identity: &str,
    ) -> Result<Vec<DispatchRequest>, StoreError>;

    /// Requests of `kind` offered to `identity`, oldest first
    async fn list_by_candidate(
        &self,
        kind: RequestKind,
        identity: &str,
    ) -> Result<Vec<DispatchRequest>, StoreError>;
}
