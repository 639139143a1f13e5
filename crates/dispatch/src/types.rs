//! Dispatch domain models
//!
//! Responder profiles and dispatch requests as persisted by the stores, plus
//! the small closed enums that select which population a call targets.

use beacon_core::{GeoPosition, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Population an identity belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponderClass {
    /// Medical responder answering SOS requests
    Doctor,
    /// Ambulance or transit service answering transit requests
    Transit,
    /// Member of the public raising SOS requests
    Client,
}

impl ResponderClass {
    /// Stable storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponderClass::Doctor => "doctor",
            ResponderClass::Transit => "transit",
            ResponderClass::Client => "client",
        }
    }

    /// Whether identities of this class report a position
    pub fn is_locatable(&self) -> bool {
        matches!(self, ResponderClass::Doctor | ResponderClass::Transit)
    }
}

impl fmt::Display for ResponderClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponderClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "doctor" => Ok(ResponderClass::Doctor),
            "transit" => Ok(ResponderClass::Transit),
            "client" => Ok(ResponderClass::Client),
            other => Err(format!("unknown responder class: {}", other)),
        }
    }
}

/// Kind of dispatch request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Client asks nearby doctors for help
    Sos,
    /// Claiming doctor asks nearby transit services for transport
    Transit,
}

impl RequestKind {
    /// Class allowed to create, escalate and resolve requests of this kind
    pub fn requester_class(&self) -> ResponderClass {
        match self {
            RequestKind::Sos => ResponderClass::Client,
            RequestKind::Transit => ResponderClass::Doctor,
        }
    }

    /// Class offered requests of this kind
    pub fn candidate_class(&self) -> ResponderClass {
        match self {
            RequestKind::Sos => ResponderClass::Doctor,
            RequestKind::Transit => ResponderClass::Transit,
        }
    }

    /// Stable storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Sos => "sos",
            RequestKind::Transit => "transit",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sos" => Ok(RequestKind::Sos),
            "transit" => Ok(RequestKind::Transit),
            other => Err(format!("unknown request kind: {}", other)),
        }
    }
}

/// Descriptive details shown to counterparts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileInfo {
    /// Display name
    pub name: Option<String>,
    /// Contact number
    pub phone: Option<String>,
    /// Job description (doctors)
    pub designation: Option<String>,
}

/// Per-responder statistic maintained by the counter ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterField {
    /// Number of requests offered to the responder
    Offered,
    /// Number of requests the responder claimed
    Accepted,
}

impl CounterField {
    /// Storage column name
    pub fn column(&self) -> &'static str {
        match self {
            CounterField::Offered => "offered_count",
            CounterField::Accepted => "accepted_count",
        }
    }
}

/// Stored profile of a doctor, transit service or client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponderProfile {
    /// Unique email-like key
    pub identity: String,

    /// Population this profile belongs to
    pub class: ResponderClass,

    /// Descriptive details
    pub info: ProfileInfo,

    /// Last reported position (absent until first report)
    pub position: Option<GeoPosition>,

    /// Push notification handle (absent until registered)
    pub device_handle: Option<String>,

    /// Requests offered to this responder
    pub offered_count: u64,

    /// Requests claimed by this responder
    pub accepted_count: u64,

    /// Creation timestamp (Unix epoch milliseconds)
    pub created_at: Timestamp,

    /// Last update timestamp
    pub updated_at: Timestamp,
}

impl ResponderProfile {
    /// Create a new profile with no position, device or history
    pub fn new(identity: impl Into<String>, class: ResponderClass, timestamp: Timestamp) -> Self {
        Self {
            identity: identity.into(),
            class,
            info: ProfileInfo::default(),
            position: None,
            device_handle: None,
            offered_count: 0,
            accepted_count: 0,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    /// Set position (builder style)
    pub fn with_position(mut self, position: GeoPosition) -> Self {
        self.position = Some(position);
        self
    }

    /// Set device handle (builder style)
    pub fn with_device_handle(mut self, handle: impl Into<String>) -> Self {
        self.device_handle = Some(handle.into());
        self
    }

    /// Set descriptive info (builder style)
    pub fn with_info(mut self, info: ProfileInfo) -> Self {
        self.info = info;
        self
    }

    /// Profile view safe to hand to a counterpart
    pub fn sanitized(&self) -> SanitizedProfile {
        SanitizedProfile {
            identity: self.identity.clone(),
            class: self.class,
            info: self.info.clone(),
        }
    }

    /// Apply a partial update and bump `updated_at`
    pub fn apply(&mut self, fields: &ProfileFields, timestamp: Timestamp) {
        if let Some(position) = fields.position {
            self.position = Some(position);
        }
        if let Some(handle) = &fields.device_handle {
            self.device_handle = Some(handle.clone());
        }
        if let Some(info) = &fields.info {
            self.info = info.clone();
        }
        self.updated_at = timestamp.max(self.updated_at);
    }
}

/// Profile stripped of device handle, position, counters and timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizedProfile {
    /// Unique email-like key
    pub identity: String,
    /// Population this profile belongs to
    pub class: ResponderClass,
    /// Descriptive details
    pub info: ProfileInfo,
}

impl SanitizedProfile {
    /// Minimal view when only the identity is known
    pub fn bare(identity: impl Into<String>, class: ResponderClass) -> Self {
        Self {
            identity: identity.into(),
            class,
            info: ProfileInfo::default(),
        }
    }
}

/// Partial profile update; `None` leaves the stored value untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub position: Option<GeoPosition>,
    pub device_handle: Option<String>,
    pub info: Option<ProfileInfo>,
}

/// Lifecycle state derived from a request's persisted fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    /// Offered to the initial candidate set
    Broadcasting,
    /// Search radius widened at least once
    Escalating,
    /// A responder holds the request
    Claimed,
    /// Every candidate declined and nobody claimed
    Exhausted,
    /// Closed by the requester
    Resolved,
}

impl RequestState {
    /// Check if state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Resolved)
    }
}

/// Emergency request and its dispatch bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Unique request identifier
    pub id: String,

    /// SOS or derived transit request
    pub kind: RequestKind,

    /// Identity that raised the request
    pub requester: String,

    /// Where help is needed
    pub origin: GeoPosition,

    /// Free-text note from the requester
    pub note: String,

    /// Responders offered this request, in offer order
    pub candidates: Vec<String>,

    /// Responder holding the request
    pub claimant: Option<String>,

    /// Number of candidates that declined
    pub rejection_count: u32,

    /// Candidates that declined, in decline order
    #[serde(default)]
    pub decliners: Vec<String>,

    /// Closed by the requester
    pub resolved: bool,

    /// Number of escalations that added candidates
    pub escalations: u32,

    /// Request this one was derived from
    pub parent_id: Option<String>,

    /// Creation timestamp (Unix epoch milliseconds)
    pub created_at: Timestamp,

    /// Last update timestamp
    pub updated_at: Timestamp,
}

impl DispatchRequest {
    /// Create a new unclaimed, unresolved request
    pub fn new(
        id: String,
        kind: RequestKind,
        requester: String,
        origin: GeoPosition,
        note: String,
        candidates: Vec<String>,
        timestamp: Timestamp,
    ) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if !unique.contains(&candidate) {
                unique.push(candidate);
            }
        }

        Self {
            id,
            kind,
            requester,
            origin,
            note,
            candidates: unique,
            claimant: None,
            rejection_count: 0,
            decliners: Vec::new(),
            resolved: false,
            escalations: 0,
            parent_id: None,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    /// Link this request to the request it was derived from
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> RequestState {
        if self.resolved {
            RequestState::Resolved
        } else if self.claimant.is_some() {
            RequestState::Claimed
        } else if self.is_exhausted() {
            RequestState::Exhausted
        } else if self.escalations > 0 {
            RequestState::Escalating
        } else {
            RequestState::Broadcasting
        }
    }

    /// Every candidate declined
    pub fn is_exhausted(&self) -> bool {
        !self.candidates.is_empty() && self.rejection_count as usize >= self.candidates.len()
    }

    /// Check whether `identity` was offered this request
    pub fn is_candidate(&self, identity: &str) -> bool {
        self.candidates.iter().any(|c| c == identity)
    }

    /// Check whether `identity` already declined
    pub fn has_declined(&self, identity: &str) -> bool {
        self.decliners.iter().any(|d| d == identity)
    }

    /// Whether the decline by `identity` is the one that exhausted the request
    pub fn exhausted_by(&self, identity: &str) -> bool {
        self.claimant.is_none()
            && !self.resolved
            && self.rejection_count as usize == self.candidates.len()
            && self.decliners.last().map(String::as_str) == Some(identity)
    }

    /// Candidates still waiting to hear how the request ended
    pub fn candidates_except(&self, excluded: Option<&str>) -> Vec<String> {
        self.candidates
            .iter()
            .filter(|c| Some(c.as_str()) != excluded)
            .cloned()
            .collect()
    }

    /// Timestamp for the next mutation; strictly after `updated_at`
    pub fn next_timestamp(&self, now: Timestamp) -> Timestamp {
        now.max(self.updated_at + 1)
    }

    /// Record a mutation at `now`
    pub fn touch(&mut self, now: Timestamp) {
        self.updated_at = self.next_timestamp(now);
    }
}
