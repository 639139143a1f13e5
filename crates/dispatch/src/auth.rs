//! Identity verification
//!
//! The engine treats verification as a black box behind [`IdentityVerifier`].
//! [`CredentialRegistry`] is the embedded implementation: it keeps a BLAKE3
//! digest of each credential and never the credential itself.

use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::types::ResponderClass;

/// Verification failures
#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    /// Unknown identity or credential mismatch
    #[error("{0}")]
    Unauthorized(String),

    /// Verifier could not be reached
    #[error("Verifier unavailable: {0}")]
    Unavailable(String),

    /// Stored digest is malformed
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
}

/// Checks that a caller is who it claims to be
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Succeed only if `credential` belongs to `identity` in `class`
    async fn verify(
        &self,
        class: ResponderClass,
        identity: &str,
        credential: &str,
    ) -> Result<(), AuthError>;

    /// Record a credential for a newly registered identity. Must not
    /// replace a different credential already held for the identity.
    async fn enroll(
        &self,
        class: ResponderClass,
        identity: &str,
        credential: &str,
    ) -> Result<(), AuthError> {
        let _ = (class, identity, credential);
        Err(AuthError::Unavailable(
            "verifier does not accept enrollment".to_string(),
        ))
    }
}

/// In-process registry of credential digests keyed by (class, identity)
#[derive(Debug, Default)]
pub struct CredentialRegistry {
    digests: RwLock<HashMap<(ResponderClass, String), blake3::Hash>>,
}

impl CredentialRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a credential
    pub fn register(&self, class: ResponderClass, identity: &str, credential: &str) {
        self.insert(class, identity, blake3::hash(credential.as_bytes()));
    }

    /// Register a precomputed hex-encoded BLAKE3 digest
    pub fn register_digest_hex(
        &self,
        class: ResponderClass,
        identity: &str,
        digest_hex: &str,
    ) -> Result<(), AuthError> {
        let bytes = hex::decode(digest_hex).map_err(|e| AuthError::InvalidDigest(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuthError::InvalidDigest("expected 32 bytes".to_string()))?;
        self.insert(class, identity, blake3::Hash::from(bytes));
        Ok(())
    }

    /// Hex digest for `credential`, suitable for `register_digest_hex`
    pub fn digest_hex(credential: &str) -> String {
        hex::encode(blake3::hash(credential.as_bytes()).as_bytes())
    }

    fn insert(&self, class: ResponderClass, identity: &str, digest: blake3::Hash) {
        match self.digests.write() {
            Ok(mut digests) => {
                digests.insert((class, identity.to_string()), digest);
            }
            Err(poisoned) => {
                poisoned
                    .into_inner()
                    .insert((class, identity.to_string()), digest);
            }
        }
    }
}

#[async_trait]
impl IdentityVerifier for CredentialRegistry {
    async fn verify(
        &self,
        class: ResponderClass,
        identity: &str,
        credential: &str,
    ) -> Result<(), AuthError> {
        let stored = {
            let digests = self
                .digests
                .read()
                .map_err(|_| AuthError::Unavailable("registry lock poisoned".to_string()))?;
            digests.get(&(class, identity.to_string())).copied()
        };

        // blake3::Hash equality is constant-time
        match stored {
            Some(digest) if digest == blake3::hash(credential.as_bytes()) => Ok(()),
            Some(_) => {
                debug!(class = %class, identity, "Credential mismatch");
                Err(AuthError::Unauthorized(format!("{} {}", class, identity)))
            }
            None => Err(AuthError::Unauthorized(format!("unknown {} {}", class, identity))),
        }
    }

    async fn enroll(
        &self,
        class: ResponderClass,
        identity: &str,
        credential: &str,
    ) -> Result<(), AuthError> {
        let digest = blake3::hash(credential.as_bytes());
        let mut digests = self
            .digests
            .write()
            .map_err(|_| AuthError::Unavailable("registry lock poisoned".to_string()))?;
        match digests.entry((class, identity.to_string())) {
            Entry::Vacant(slot) => {
                slot.insert(digest);
                Ok(())
            }
            // Re-enrolling the same credential is a retry
            Entry::Occupied(existing) if *existing.get() == digest => Ok(()),
            Entry::Occupied(_) => Err(AuthError::Unauthorized(format!(
                "{} {} already enrolled",
                class, identity
            ))),
        }
    }
}
