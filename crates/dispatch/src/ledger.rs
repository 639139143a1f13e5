//! Per-responder counters
//!
//! Increments are additive and go straight to the store, so they commute
//! with profile edits. A retried increment after a timeout may count twice.

use beacon_core::now_millis;
use std::sync::Arc;
use tracing::debug;

use crate::error::StoreError;
use crate::retry::RetryPolicy;
use crate::store::ResponderStore;
use crate::types::{CounterField, ResponderClass, ResponderProfile};

#[derive(Clone)]
pub struct CounterLedger {
    store: Arc<dyn ResponderStore>,
    retry: RetryPolicy,
}

impl CounterLedger {
    pub fn new(store: Arc<dyn ResponderStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Count one offer; returns the updated profile
    pub async fn record_offer(
        &self,
        class: ResponderClass,
        identity: &str,
    ) -> Result<ResponderProfile, StoreError> {
        self.bump(class, identity, CounterField::Offered).await
    }

    /// Count one claim; returns the updated profile
    pub async fn record_acceptance(
        &self,
        class: ResponderClass,
        identity: &str,
    ) -> Result<ResponderProfile, StoreError> {
        self.bump(class, identity, CounterField::Accepted).await
    }

    async fn bump(
        &self,
        class: ResponderClass,
        identity: &str,
        field: CounterField,
    ) -> Result<ResponderProfile, StoreError> {
        let profile = self
            .retry
            .run("increment", || {
                self.store.increment(class, identity, field, 1, now_millis())
            })
            .await?;
        debug!(
            class = %class,
            identity,
            counter = field.column(),
            offered = profile.offered_count,
            accepted = profile.accepted_count,
            "Counter incremented"
        );
        Ok(profile)
    }
}
