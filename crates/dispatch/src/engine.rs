//! Dispatch & resolution state machine
//!
//! Every operation re-authenticates, loads the persisted request and lets a
//! conditional store update decide the transition. Side effects (counters and
//! notifications) run only in the call that performed the transition.
//!
//! # Request lifecycle
//!
//! ```text
//! Broadcasting -> (Escalating)* -> Claimed   -> Resolved
//!                               -> Exhausted -> Resolved
//!                               -> Resolved
//! ```
//!
//! `Exhausted` still accepts a late claim. `Resolved` is terminal.

use beacon_core::{now_millis, Config, GeoPosition};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::IdentityVerifier;
use crate::directory::CandidateDirectory;
use crate::error::DispatchError;
use crate::geofence::Geofence;
use crate::ledger::CounterLedger;
use crate::notify::{NotificationCoordinator, NotificationGateway, NotificationPayload};
use crate::retry::RetryPolicy;
use crate::store::{ClaimOutcome, RejectionOutcome, RequestStore, ResolveOutcome, ResponderStore};
use crate::types::{
    DispatchRequest, RequestKind, RequestState, ResponderClass, SanitizedProfile,
};

/// Outcome of a decline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclineAck {
    pub request_id: String,
    /// Whether this call incremented the rejection count
    pub counted: bool,
    pub rejection_count: u32,
    pub candidate_count: u32,
    /// Request state after the decline
    pub state: RequestState,
}

impl DeclineAck {
    fn from_request(request: &DispatchRequest, counted: bool) -> Self {
        Self {
            request_id: request.id.clone(),
            counted,
            rejection_count: request.rejection_count,
            candidate_count: request.candidates.len() as u32,
            state: request.state(),
        }
    }
}

/// Entry point for every dispatch operation
pub struct DispatchEngine {
    pub(crate) profiles: Arc<dyn ResponderStore>,
    pub(crate) requests: Arc<dyn RequestStore>,
    pub(crate) verifier: Arc<dyn IdentityVerifier>,
    pub(crate) retry: RetryPolicy,
    directory: CandidateDirectory,
    ledger: CounterLedger,
    notifier: NotificationCoordinator,
}

impl DispatchEngine {
    /// Build an engine and start its notification workers.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        config: &Config,
        profiles: Arc<dyn ResponderStore>,
        requests: Arc<dyn RequestStore>,
        verifier: Arc<dyn IdentityVerifier>,
        gateway: Arc<dyn NotificationGateway>,
    ) -> Result<Self, DispatchError> {
        config.validate()?;

        let retry = RetryPolicy::from_config(&config.store);
        let geofence = Geofence::new(config.dispatch.max_radius_m);
        let directory = CandidateDirectory::new(profiles.clone(), geofence, retry);
        let ledger = CounterLedger::new(profiles.clone(), retry);
        let notifier =
            NotificationCoordinator::new(gateway, profiles.clone(), retry, &config.notifications);

        info!(
            max_radius_m = config.dispatch.max_radius_m,
            workers = config.notifications.workers,
            store_attempts = retry.max_attempts,
            "Dispatch engine ready"
        );

        Ok(Self {
            profiles,
            requests,
            verifier,
            retry,
            directory,
            ledger,
            notifier,
        })
    }

    /// Notification coordinator, for metrics and `wait_idle`
    pub fn notifier(&self) -> &NotificationCoordinator {
        &self.notifier
    }

    pub(crate) async fn authenticate(
        &self,
        class: ResponderClass,
        identity: &str,
        credential: &str,
    ) -> Result<(), DispatchError> {
        self.verifier
            .verify(class, identity, credential)
            .await
            .map_err(|e| {
                warn!(class = %class, identity, error = %e, "Authentication failed");
                DispatchError::from(e)
            })
    }

    pub(crate) async fn load_request(&self, id: &str) -> Result<DispatchRequest, DispatchError> {
        Ok(self.retry.run("get_request", || self.requests.get(id)).await?)
    }

    /// Raise a new request and offer it to every responder in range
    pub async fn create(
        &self,
        kind: RequestKind,
        requester: &str,
        credential: &str,
        origin: GeoPosition,
        note: &str,
        radius_m: f64,
    ) -> Result<DispatchRequest, DispatchError> {
        self.authenticate(kind.requester_class(), requester, credential)
            .await?;
        self.broadcast(kind, requester, origin, note, radius_m, None)
            .await
    }

    /// Raise an SOS request as a client
    pub async fn create_sos(
        &self,
        client: &str,
        credential: &str,
        origin: GeoPosition,
        note: &str,
        radius_m: f64,
    ) -> Result<DispatchRequest, DispatchError> {
        self.create(RequestKind::Sos, client, credential, origin, note, radius_m)
            .await
    }

    /// Derive a transit request from an SOS request the doctor claimed.
    ///
    /// The transit request starts at the SOS origin and reuses its note
    /// unless a new one is given.
    pub async fn spawn_transit(
        &self,
        doctor: &str,
        credential: &str,
        parent_id: &str,
        radius_m: f64,
        note: Option<&str>,
    ) -> Result<DispatchRequest, DispatchError> {
        let parent = self.load_request(parent_id).await?;
        self.authenticate(ResponderClass::Doctor, doctor, credential)
            .await?;

        if parent.kind != RequestKind::Sos {
            return Err(DispatchError::InvalidClass(ResponderClass::Transit));
        }
        if parent.claimant.as_deref() != Some(doctor) {
            return Err(DispatchError::Unauthorized(format!(
                "{} does not hold request {}",
                doctor, parent_id
            )));
        }
        if parent.resolved {
            return Err(DispatchError::AlreadyResolved(parent.id));
        }

        let note = note.unwrap_or(parent.note.as_str());
        self.broadcast(
            RequestKind::Transit,
            doctor,
            parent.origin,
            note,
            radius_m,
            Some(parent.id.as_str()),
        )
        .await
    }

    async fn broadcast(
        &self,
        kind: RequestKind,
        requester: &str,
        origin: GeoPosition,
        note: &str,
        radius_m: f64,
        parent_id: Option<&str>,
    ) -> Result<DispatchRequest, DispatchError> {
        let origin = GeoPosition::new(origin.lat, origin.lon)?;
        let nearby = self
            .directory
            .nearby(kind.candidate_class(), &origin, radius_m)
            .await?;

        let mut request = DispatchRequest::new(
            Uuid::new_v4().to_string(),
            kind,
            requester.to_string(),
            origin,
            note.to_string(),
            nearby.identities(),
            now_millis(),
        );
        if let Some(parent_id) = parent_id {
            request = request.with_parent(parent_id);
        }

        self.retry
            .run("create_request", || self.requests.create(request.clone()))
            .await?;

        info!(
            request_id = %request.id,
            kind = %kind,
            requester,
            radius_m,
            candidates = request.candidates.len(),
            parent_id = ?request.parent_id,
            "Request created"
        );

        self.offer_to(&request, &request.candidates).await;
        Ok(request)
    }

    /// Widen the search radius and offer the request to newly found responders
    pub async fn escalate(
        &self,
        requester: &str,
        credential: &str,
        request_id: &str,
        radius_m: f64,
    ) -> Result<DispatchRequest, DispatchError> {
        let request = self.load_request(request_id).await?;
        self.authenticate(request.kind.requester_class(), requester, credential)
            .await?;
        self.ensure_requester(&request, requester)?;

        if request.resolved {
            return Err(DispatchError::AlreadyResolved(request.id));
        }
        if let Some(claimant) = &request.claimant {
            return Err(DispatchError::AlreadyClaimed {
                request_id: request.id.clone(),
                claimant: claimant.clone(),
            });
        }

        let nearby = self
            .directory
            .nearby(request.kind.candidate_class(), &request.origin, radius_m)
            .await?;
        let found = nearby.identities();

        let mut attempts = 0u32;
        let mut outcome = self
            .retry
            .run("append_candidates", || {
                attempts += 1;
                self.requests
                    .append_candidates(request_id, &found, now_millis())
            })
            .await?;
        if outcome.request.resolved {
            return Err(DispatchError::AlreadyResolved(outcome.request.id));
        }
        if attempts > 1 {
            // An earlier attempt may have merged before its deadline expired
            outcome.added = found
                .iter()
                .filter(|id| !request.is_candidate(id) && outcome.request.is_candidate(id))
                .cloned()
                .collect();
        }

        info!(
            request_id,
            radius_m,
            found = found.len(),
            added = outcome.added.len(),
            candidates = outcome.request.candidates.len(),
            "Request escalated"
        );

        self.offer_to(&outcome.request, &outcome.added).await;
        Ok(outcome.request)
    }

    /// Take the request. Returns the requester's sanitized profile.
    pub async fn claim(
        &self,
        responder: &str,
        credential: &str,
        request_id: &str,
    ) -> Result<SanitizedProfile, DispatchError> {
        let request = self.load_request(request_id).await?;
        let class = request.kind.candidate_class();
        self.authenticate(class, responder, credential).await?;

        // Caller retrying a claim that already went through
        if request.claimant.as_deref() == Some(responder) {
            debug!(request_id, responder, "Claim already held by caller");
            return self.requester_profile(&request).await;
        }

        let mut attempts = 0u32;
        let outcome = self
            .retry
            .run("conditional_set_claimant", || {
                attempts += 1;
                self.requests
                    .conditional_set_claimant(request_id, responder, now_millis())
            })
            .await?;

        let claimed = match outcome {
            ClaimOutcome::Claimed(request) => request,
            // An earlier attempt of this call won before its deadline expired
            ClaimOutcome::HeldByCaller(request) if attempts > 1 => request,
            ClaimOutcome::HeldByCaller(request) => {
                debug!(request_id, responder, "Concurrent claim by the same caller");
                return self.requester_profile(&request).await;
            }
            ClaimOutcome::AlreadyClaimed { claimant, .. } => {
                debug!(request_id, responder, claimant = %claimant, "Claim lost");
                return Err(DispatchError::AlreadyClaimed {
                    request_id: request_id.to_string(),
                    claimant,
                });
            }
            ClaimOutcome::Resolved(request) => {
                return Err(DispatchError::AlreadyResolved(request.id));
            }
        };

        info!(request_id, claimant = responder, "Request claimed");

        let claimant = match self.ledger.record_acceptance(class, responder).await {
            Ok(profile) => profile.sanitized(),
            Err(e) => {
                warn!(
                    request_id,
                    responder,
                    error = %e,
                    "Accepted counter update failed"
                );
                SanitizedProfile::bare(responder, class)
            }
        };

        self.fan_out_except(
            &claimed,
            Some(responder),
            NotificationPayload::ResolvedByOther {
                request_id: claimed.id.clone(),
            },
        );

        let accepted = NotificationPayload::Accepted {
            request_id: claimed.id.clone(),
            claimant,
        };
        let requester_class = claimed.kind.requester_class();
        match self
            .retry
            .run("get_profile", || {
                self.profiles.get(requester_class, &claimed.requester)
            })
            .await
        {
            Ok(profile) => {
                self.notifier
                    .notify(profile.device_handle.as_deref(), accepted);
                Ok(profile.sanitized())
            }
            Err(e) => {
                warn!(
                    request_id,
                    requester = %claimed.requester,
                    error = %e,
                    "Requester lookup failed after claim"
                );
                self.notifier
                    .notify_identity(requester_class, &claimed.requester, accepted);
                Err(e.into())
            }
        }
    }

    /// Turn the request down
    pub async fn decline(
        &self,
        responder: &str,
        credential: &str,
        request_id: &str,
    ) -> Result<DeclineAck, DispatchError> {
        let request = self.load_request(request_id).await?;
        self.authenticate(request.kind.candidate_class(), responder, credential)
            .await?;

        if request.resolved {
            return Err(DispatchError::AlreadyResolved(request.id));
        }
        if request.claimant.is_some() {
            debug!(request_id, responder, "Decline after claim acknowledged");
            return Ok(DeclineAck::from_request(&request, false));
        }

        if request.has_declined(responder) {
            debug!(request_id, responder, "Repeated decline ignored");
            return Ok(DeclineAck::from_request(&request, false));
        }

        let mut attempts = 0u32;
        let outcome = self
            .retry
            .run("increment_rejection", || {
                attempts += 1;
                self.requests
                    .increment_rejection(request_id, responder, now_millis())
            })
            .await?;

        match outcome {
            RejectionOutcome::Counted(request) => Ok(self.declined(request, responder)),
            // An earlier attempt of this call was recorded before its deadline expired
            RejectionOutcome::AlreadyDeclined(request) if attempts > 1 => {
                Ok(self.declined(request, responder))
            }
            RejectionOutcome::NotCandidate(request) => {
                debug!(request_id, responder, "Decline from a non-candidate ignored");
                Ok(DeclineAck::from_request(&request, false))
            }
            RejectionOutcome::AlreadyDeclined(request) | RejectionOutcome::Claimed(request) => {
                Ok(DeclineAck::from_request(&request, false))
            }
            RejectionOutcome::Resolved(request) => Err(DispatchError::AlreadyResolved(request.id)),
        }
    }

    fn declined(&self, request: DispatchRequest, responder: &str) -> DeclineAck {
        info!(
            request_id = %request.id,
            responder,
            rejections = request.rejection_count,
            candidates = request.candidates.len(),
            "Request declined"
        );
        if request.exhausted_by(responder) {
            info!(request_id = %request.id, "Every candidate declined");
            self.notifier.notify_identity(
                request.kind.requester_class(),
                &request.requester,
                NotificationPayload::Exhausted {
                    request_id: request.id.clone(),
                    rejection_count: request.rejection_count,
                    candidate_count: request.candidates.len() as u32,
                },
            );
        }
        DeclineAck::from_request(&request, true)
    }

    /// Close the request. Resolving twice succeeds without side effects.
    pub async fn resolve(
        &self,
        requester: &str,
        credential: &str,
        request_id: &str,
    ) -> Result<DispatchRequest, DispatchError> {
        let request = self.load_request(request_id).await?;
        self.authenticate(request.kind.requester_class(), requester, credential)
            .await?;
        self.ensure_requester(&request, requester)?;

        let outcome = self
            .retry
            .run("set_resolved", || {
                self.requests.set_resolved(request_id, now_millis())
            })
            .await?;

        match outcome {
            ResolveOutcome::Resolved(request) => {
                info!(
                    request_id,
                    claimant = ?request.claimant,
                    "Request resolved"
                );
                self.fan_out_except(
                    &request,
                    request.claimant.as_deref(),
                    NotificationPayload::Resolved {
                        request_id: request.id.clone(),
                    },
                );
                Ok(request)
            }
            ResolveOutcome::AlreadyResolved(request) => {
                debug!(request_id, "Request already resolved");
                Ok(request)
            }
        }
    }

    fn ensure_requester(
        &self,
        request: &DispatchRequest,
        caller: &str,
    ) -> Result<(), DispatchError> {
        if request.requester == caller {
            Ok(())
        } else {
            Err(DispatchError::Unauthorized(format!(
                "{} did not raise request {}",
                caller, request.id
            )))
        }
    }

    async fn requester_profile(
        &self,
        request: &DispatchRequest,
    ) -> Result<SanitizedProfile, DispatchError> {
        let class = request.kind.requester_class();
        let profile = self
            .retry
            .run("get_profile", || self.profiles.get(class, &request.requester))
            .await?;
        Ok(profile.sanitized())
    }

    /// Count and send offers; each identity is handled independently
    async fn offer_to(&self, request: &DispatchRequest, identities: &[String]) {
        let class = request.kind.candidate_class();
        let payload = NotificationPayload::Offer {
            request_id: request.id.clone(),
            request_kind: request.kind,
            origin: request.origin,
            note: request.note.clone(),
        };

        let offers = identities.iter().map(|identity| {
            let payload = payload.clone();
            async move {
                match self.ledger.record_offer(class, identity).await {
                    Ok(profile) => self
                        .notifier
                        .notify(profile.device_handle.as_deref(), payload),
                    Err(e) => {
                        warn!(
                            request_id = %request.id,
                            identity = %identity,
                            error = %e,
                            "Offered counter update failed"
                        );
                        self.notifier.notify_identity(class, identity, payload);
                    }
                }
            }
        });
        join_all(offers).await;
    }

    /// Send `payload` to every candidate of `request` except `excluded`
    fn fan_out_except(
        &self,
        request: &DispatchRequest,
        excluded: Option<&str>,
        payload: NotificationPayload,
    ) {
        let recipients = request.candidates_except(excluded);
        debug!(
            request_id = %request.id,
            title = payload.title(),
            recipients = recipients.len(),
            "Fanning out"
        );
        self.notifier
            .fan_out(request.kind.candidate_class(), recipients, payload);
    }
}
