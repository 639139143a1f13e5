//! Responder self-service operations: registration, location and device
//! updates, history and lookups.

use beacon_core::{now_millis, GeoPosition};
use tracing::{debug, info, warn};

use crate::engine::DispatchEngine;
use crate::auth::AuthError;
use crate::error::DispatchError;
use crate::types::{
    DispatchRequest, ProfileFields, ProfileInfo, RequestKind, ResponderClass, ResponderProfile,
    SanitizedProfile,
};

impl DispatchEngine {
    /// Create a profile and enroll its credential
    ///
    /// The profile is inserted only if absent, so concurrent registrations
    /// of one identity produce a single account. If enrollment fails the
    /// profile is removed again and the call can be retried.
    pub async fn register(
        &self,
        class: ResponderClass,
        identity: &str,
        credential: &str,
        info: ProfileInfo,
    ) -> Result<SanitizedProfile, DispatchError> {
        let profile = ResponderProfile::new(identity, class, now_millis()).with_info(info);
        let stored = self
            .retry
            .run("insert_profile", || self.profiles.insert(profile.clone()))
            .await?;
        if stored != profile {
            return Err(DispatchError::Unauthorized(format!(
                "{} {} already registered",
                class, identity
            )));
        }

        if let Err(e) = self.verifier.enroll(class, identity, credential).await {
            // Unauthorized means another caller's credential is enrolled
            if !matches!(e, AuthError::Unauthorized(_)) {
                self.discard_profile(class, identity).await;
            }
            warn!(class = %class, identity, error = %e, "Enrollment failed");
            return Err(e.into());
        }

        info!(class = %class, identity, "Profile registered");
        Ok(stored.sanitized())
    }

    async fn discard_profile(&self, class: ResponderClass, identity: &str) {
        if let Err(e) = self
            .retry
            .run("remove_profile", || self.profiles.remove(class, identity))
            .await
        {
            warn!(class = %class, identity, error = %e, "Could not remove unenrolled profile");
        }
    }

    /// Report a responder's current position
    pub async fn update_location(
        &self,
        class: ResponderClass,
        identity: &str,
        credential: &str,
        lat: f64,
        lon: f64,
    ) -> Result<ResponderProfile, DispatchError> {
        if !class.is_locatable() {
            return Err(DispatchError::InvalidClass(class));
        }
        let position = GeoPosition::new(lat, lon)?;
        self.authenticate(class, identity, credential).await?;

        let fields = ProfileFields {
            position: Some(position),
            ..Default::default()
        };
        let profile = self
            .retry
            .run("set_fields", || {
                self.profiles
                    .set_fields(class, identity, fields.clone(), now_millis())
            })
            .await?;

        debug!(class = %class, identity, lat, lon, "Location updated");
        Ok(profile)
    }

    /// Register the push notification handle for an identity
    pub async fn update_device_handle(
        &self,
        class: ResponderClass,
        identity: &str,
        credential: &str,
        device_handle: &str,
    ) -> Result<ResponderProfile, DispatchError> {
        self.authenticate(class, identity, credential).await?;

        let fields = ProfileFields {
            device_handle: Some(device_handle.to_string()),
            ..Default::default()
        };
        let profile = self
            .retry
            .run("set_fields", || {
                self.profiles
                    .set_fields(class, identity, fields.clone(), now_millis())
            })
            .await?;

        debug!(class = %class, identity, "Device handle updated");
        Ok(profile)
    }

    /// Requests the caller raised or was offered, oldest first
    ///
    /// Clients see their SOS requests; doctors see SOS requests offered to
    /// them and the transit requests they raised; transit services see the
    /// transit requests offered to them.
    pub async fn history(
        &self,
        class: ResponderClass,
        identity: &str,
        credential: &str,
    ) -> Result<Vec<DispatchRequest>, DispatchError> {
        self.authenticate(class, identity, credential).await?;

        let mut requests = match class {
            ResponderClass::Client => self.raised(RequestKind::Sos, identity).await?,
            ResponderClass::Doctor => {
                let mut offered = self.offered(RequestKind::Sos, identity).await?;
                offered.extend(self.raised(RequestKind::Transit, identity).await?);
                offered
            }
            ResponderClass::Transit => self.offered(RequestKind::Transit, identity).await?,
        };
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(requests)
    }

    async fn raised(
        &self,
        kind: RequestKind,
        identity: &str,
    ) -> Result<Vec<DispatchRequest>, DispatchError> {
        Ok(self
            .retry
            .run("list_by_requester", || {
                self.requests.list_by_requester(kind, identity)
            })
            .await?)
    }

    async fn offered(
        &self,
        kind: RequestKind,
        identity: &str,
    ) -> Result<Vec<DispatchRequest>, DispatchError> {
        Ok(self
            .retry
            .run("list_by_candidate", || {
                self.requests.list_by_candidate(kind, identity)
            })
            .await?)
    }

    /// Public view of any profile
    pub async fn profile_info(
        &self,
        caller_class: ResponderClass,
        caller: &str,
        credential: &str,
        class: ResponderClass,
        identity: &str,
    ) -> Result<SanitizedProfile, DispatchError> {
        self.authenticate(caller_class, caller, credential).await?;
        let profile = self
            .retry
            .run("get_profile", || self.profiles.get(class, identity))
            .await?;
        Ok(profile.sanitized())
    }

    /// Fetch a request the caller raised, holds or was offered
    pub async fn get_request(
        &self,
        class: ResponderClass,
        identity: &str,
        credential: &str,
        request_id: &str,
    ) -> Result<DispatchRequest, DispatchError> {
        self.authenticate(class, identity, credential).await?;
        let request = self.load_request(request_id).await?;

        let involved = if class == request.kind.requester_class() {
            request.requester == identity
        } else if class == request.kind.candidate_class() {
            request.is_candidate(identity) || request.claimant.as_deref() == Some(identity)
        } else {
            false
        };
        if !involved {
            return Err(DispatchError::Unauthorized(format!(
                "{} {} is not party to request {}",
                class, identity, request_id
            )));
        }
        Ok(request)
    }
}
