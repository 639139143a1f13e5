//! In-memory stores
//!
//! Each method takes the mutex once and decides its outcome under it, which
//! gives the per-key atomicity the engine needs. Guards never cross an await.

use async_trait::async_trait;
use beacon_core::{GeoPosition, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{
    AppendOutcome, ClaimOutcome, RejectionOutcome, RequestStore, ResolveOutcome, ResponderStore,
};
use crate::error::StoreError;
use crate::geofence::BoundingBox;
use crate::types::{
    CounterField, DispatchRequest, ProfileFields, RequestKind, ResponderClass, ResponderProfile,
};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("store mutex poisoned".to_string()))
}

fn profile_key(class: ResponderClass, identity: &str) -> String {
    format!("{}/{}", class, identity)
}

/// Responder profiles held in a `BTreeMap` so box queries come back ordered
#[derive(Debug, Default)]
pub struct MemoryResponderStore {
    profiles: Mutex<BTreeMap<(ResponderClass, String), ResponderProfile>>,
}

impl MemoryResponderStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponderStore for MemoryResponderStore {
    async fn put(&self, profile: ResponderProfile) -> Result<(), StoreError> {
        let mut profiles = lock(&self.profiles)?;
        profiles.insert((profile.class, profile.identity.clone()), profile);
        Ok(())
    }

    async fn insert(&self, profile: ResponderProfile) -> Result<ResponderProfile, StoreError> {
        let mut profiles = lock(&self.profiles)?;
        Ok(profiles
            .entry((profile.class, profile.identity.clone()))
            .or_insert(profile)
            .clone())
    }

    async fn remove(&self, class: ResponderClass, identity: &str) -> Result<(), StoreError> {
        let mut profiles = lock(&self.profiles)?;
        profiles.remove(&(class, identity.to_string()));
        Ok(())
    }

    async fn get(
        &self,
        class: ResponderClass,
        identity: &str,
    ) -> Result<ResponderProfile, StoreError> {
        let profiles = lock(&self.profiles)?;
        profiles
            .get(&(class, identity.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(profile_key(class, identity)))
    }

    async fn find_in_box(
        &self,
        class: ResponderClass,
        bbox: &BoundingBox,
    ) -> Result<Vec<(String, GeoPosition)>, StoreError> {
        let profiles = lock(&self.profiles)?;
        Ok(profiles
            .values()
            .filter(|p| p.class == class)
            .filter_map(|p| p.position.map(|pos| (p.identity.clone(), pos)))
            .filter(|(_, pos)| bbox.contains(pos))
            .collect())
    }

    async fn increment(
        &self,
        class: ResponderClass,
        identity: &str,
        field: CounterField,
        delta: u64,
        now: Timestamp,
    ) -> Result<ResponderProfile, StoreError> {
        let mut profiles = lock(&self.profiles)?;
        let profile = profiles
            .get_mut(&(class, identity.to_string()))
            .ok_or_else(|| StoreError::NotFound(profile_key(class, identity)))?;
        match field {
            CounterField::Offered => profile.offered_count += delta,
            CounterField::Accepted => profile.accepted_count += delta,
        }
        profile.updated_at = now.max(profile.updated_at + 1);
        Ok(profile.clone())
    }

    async fn set_fields(
        &self,
        class: ResponderClass,
        identity: &str,
        fields: ProfileFields,
        now: Timestamp,
    ) -> Result<ResponderProfile, StoreError> {
        let mut profiles = lock(&self.profiles)?;
        let profile = profiles
            .get_mut(&(class, identity.to_string()))
            .ok_or_else(|| StoreError::NotFound(profile_key(class, identity)))?;
        let timestamp = now.max(profile.updated_at + 1);
        profile.apply(&fields, timestamp);
        Ok(profile.clone())
    }
}

/// Dispatch requests held in a `HashMap` keyed by id
#[derive(Debug, Default)]
pub struct MemoryRequestStore {
    requests: Mutex<HashMap<String, DispatchRequest>>,
}

impl MemoryRequestStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn list<F>(&self, kind: RequestKind, predicate: F) -> Result<Vec<DispatchRequest>, StoreError>
    where
        F: Fn(&DispatchRequest) -> bool,
    {
        let requests = lock(&self.requests)?;
        let mut matched: Vec<DispatchRequest> = requests
            .values()
            .filter(|r| r.kind == kind && predicate(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matched)
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn create(&self, request: DispatchRequest) -> Result<String, StoreError> {
        let mut requests = lock(&self.requests)?;
        let id = request.id.clone();
        requests.entry(id.clone()).or_insert(request);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<DispatchRequest, StoreError> {
        let requests = lock(&self.requests)?;
        requests
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn conditional_set_claimant(
        &self,
        id: &str,
        responder: &str,
        now: Timestamp,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut requests = lock(&self.requests)?;
        let request = requests
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if request.claimant.as_deref() == Some(responder) {
            return Ok(ClaimOutcome::HeldByCaller(request.clone()));
        }
        if let Some(claimant) = &request.claimant {
            return Ok(ClaimOutcome::AlreadyClaimed {
                claimant: claimant.clone(),
                request: request.clone(),
            });
        }
        if request.resolved {
            return Ok(ClaimOutcome::Resolved(request.clone()));
        }

        request.claimant = Some(responder.to_string());
        request.touch(now);
        Ok(ClaimOutcome::Claimed(request.clone()))
    }

    async fn increment_rejection(
        &self,
        id: &str,
        responder: &str,
        now: Timestamp,
    ) -> Result<RejectionOutcome, StoreError> {
        let mut requests = lock(&self.requests)?;
        let request = requests
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if request.resolved {
            return Ok(RejectionOutcome::Resolved(request.clone()));
        }
        if request.claimant.is_some() {
            return Ok(RejectionOutcome::Claimed(request.clone()));
        }
        if request.has_declined(responder) {
            return Ok(RejectionOutcome::AlreadyDeclined(request.clone()));
        }
        if !request.is_candidate(responder) {
            return Ok(RejectionOutcome::NotCandidate(request.clone()));
        }

        request.decliners.push(responder.to_string());
        request.rejection_count += 1;
        request.touch(now);
        Ok(RejectionOutcome::Counted(request.clone()))
    }

    async fn append_candidates(
        &self,
        id: &str,
        candidates: &[String],
        now: Timestamp,
    ) -> Result<AppendOutcome, StoreError> {
        let mut requests = lock(&self.requests)?;
        let request = requests
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if request.resolved {
            return Ok(AppendOutcome {
                request: request.clone(),
                added: Vec::new(),
            });
        }

        let mut added = Vec::new();
        for candidate in candidates {
            if !request.is_candidate(candidate) {
                request.candidates.push(candidate.clone());
                added.push(candidate.clone());
            }
        }
        if !added.is_empty() {
            request.escalations += 1;
            request.touch(now);
        }

        Ok(AppendOutcome {
            request: request.clone(),
            added,
        })
    }

    async fn set_resolved(&self, id: &str, now: Timestamp) -> Result<ResolveOutcome, StoreError> {
        let mut requests = lock(&self.requests)?;
        let request = requests
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if request.resolved {
            return Ok(ResolveOutcome::AlreadyResolved(request.clone()));
        }
        request.resolved = true;
        request.touch(now);
        Ok(ResolveOutcome::Resolved(request.clone()))
    }

    async fn list_by_requester(
        &self,
        kind: RequestKind,
        identity: &str,
    ) -> Result<Vec<DispatchRequest>, StoreError> {
        self.list(kind, |r| r.requester == identity)
    }

    async fn list_by_candidate(
        &self,
        kind: RequestKind,
        identity: &str,
    ) -> Result<Vec<DispatchRequest>, StoreError> {
        self.list(kind, |r| r.is_candidate(identity))
    }
}
