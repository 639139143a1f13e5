//! SQLite store
//!
//! One connection behind a mutex, driven from `spawn_blocking`. Conditional
//! updates carry their guard in the `WHERE` clause so the decision is taken
//! by SQLite against the persisted row:
//!
//! - claim: `claimant IS NULL AND resolved = 0`
//! - decline: `INSERT OR IGNORE` into `request_decliners`, guarded on the
//!   responder being a candidate of an open request; the count moves only
//!   when a row was inserted
//! - candidate merge: `INSERT OR IGNORE` inside an immediate transaction

use async_trait::async_trait;
use beacon_core::{GeoPosition, Timestamp};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use super::{
    AppendOutcome, ClaimOutcome, RejectionOutcome, RequestStore, ResolveOutcome, ResponderStore,
};
use crate::error::StoreError;
use crate::geofence::BoundingBox;
use crate::types::{
    CounterField, DispatchRequest, ProfileFields, ProfileInfo, RequestKind, ResponderClass,
    ResponderProfile,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    class TEXT NOT NULL,
    identity TEXT NOT NULL,
    name TEXT,
    phone TEXT,
    designation TEXT,
    lat REAL,
    lon REAL,
    device_handle TEXT,
    offered_count INTEGER NOT NULL DEFAULT 0,
    accepted_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (class, identity)
);
CREATE INDEX IF NOT EXISTS idx_profiles_position ON profiles(class, lat, lon);

CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    requester TEXT NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    note TEXT NOT NULL,
    claimant TEXT,
    rejection_count INTEGER NOT NULL DEFAULT 0,
    candidate_count INTEGER NOT NULL DEFAULT 0,
    resolved INTEGER NOT NULL DEFAULT 0,
    escalations INTEGER NOT NULL DEFAULT 0,
    parent_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_requests_requester ON requests(kind, requester);

CREATE TABLE IF NOT EXISTS request_candidates (
    request_id TEXT NOT NULL,
    identity TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (request_id, identity)
);
CREATE INDEX IF NOT EXISTS idx_request_candidates_identity ON request_candidates(identity);

CREATE TABLE IF NOT EXISTS request_decliners (
    request_id TEXT NOT NULL,
    identity TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (request_id, identity)
);
"#;

const PROFILE_COLUMNS: &str = "class, identity, name, phone, designation, lat, lon, \
     device_handle, offered_count, accepted_count, created_at, updated_at";

const REQUEST_COLUMNS: &str = "id, kind, requester, lat, lon, note, claimant, \
     rejection_count, resolved, escalations, parent_id, created_at, updated_at";

/// SQLite-backed responder and request store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database file in WAL mode
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening dispatch store");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

fn ts(value: Timestamp) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn position(lat: Option<f64>, lon: Option<f64>) -> Result<Option<GeoPosition>, StoreError> {
    match (lat, lon) {
        (Some(lat), Some(lon)) => GeoPosition::new(lat, lon)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(e.to_string())),
        _ => Ok(None),
    }
}

struct ProfileRow {
    class: String,
    identity: String,
    info: ProfileInfo,
    lat: Option<f64>,
    lon: Option<f64>,
    device_handle: Option<String>,
    offered_count: i64,
    accepted_count: i64,
    created_at: i64,
    updated_at: i64,
}

impl ProfileRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            class: row.get(0)?,
            identity: row.get(1)?,
            info: ProfileInfo {
                name: row.get(2)?,
                phone: row.get(3)?,
                designation: row.get(4)?,
            },
            lat: row.get(5)?,
            lon: row.get(6)?,
            device_handle: row.get(7)?,
            offered_count: row.get(8)?,
            accepted_count: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_profile(self) -> Result<ResponderProfile, StoreError> {
        Ok(ResponderProfile {
            class: self.class.parse().map_err(StoreError::Corrupt)?,
            position: position(self.lat, self.lon)?,
            identity: self.identity,
            info: self.info,
            device_handle: self.device_handle,
            offered_count: self.offered_count.max(0) as u64,
            accepted_count: self.accepted_count.max(0) as u64,
            created_at: self.created_at.max(0) as u64,
            updated_at: self.updated_at.max(0) as u64,
        })
    }
}

fn write_profile(conn: &Connection, verb: &str, profile: &ResponderProfile) -> Result<usize, StoreError> {
    let sql = format!(
        "{} INTO profiles ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        verb, PROFILE_COLUMNS
    );
    Ok(conn.execute(
        &sql,
        params![
            profile.class.as_str(),
            profile.identity,
            profile.info.name,
            profile.info.phone,
            profile.info.designation,
            profile.position.map(|p| p.lat),
            profile.position.map(|p| p.lon),
            profile.device_handle,
            ts(profile.offered_count),
            ts(profile.accepted_count),
            ts(profile.created_at),
            ts(profile.updated_at),
        ],
    )?)
}

fn load_profile(
    conn: &Connection,
    class: ResponderClass,
    identity: &str,
) -> Result<ResponderProfile, StoreError> {
    let sql = format!(
        "SELECT {} FROM profiles WHERE class = ?1 AND identity = ?2",
        PROFILE_COLUMNS
    );
    conn.query_row(&sql, params![class.as_str(), identity], ProfileRow::read)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("{}/{}", class, identity)))?
        .into_profile()
}

struct RequestRow {
    id: String,
    kind: String,
    requester: String,
    lat: f64,
    lon: f64,
    note: String,
    claimant: Option<String>,
    rejection_count: i64,
    resolved: bool,
    escalations: i64,
    parent_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RequestRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            requester: row.get(2)?,
            lat: row.get(3)?,
            lon: row.get(4)?,
            note: row.get(5)?,
            claimant: row.get(6)?,
            rejection_count: row.get(7)?,
            resolved: row.get(8)?,
            escalations: row.get(9)?,
            parent_id: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}

fn load_request(conn: &Connection, id: &str) -> Result<DispatchRequest, StoreError> {
    let sql = format!("SELECT {} FROM requests WHERE id = ?1", REQUEST_COLUMNS);
    let row = conn
        .query_row(&sql, params![id], RequestRow::read)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

    let mut stmt = conn.prepare_cached(
        "SELECT identity FROM request_candidates WHERE request_id = ?1 ORDER BY position",
    )?;
    let candidates = stmt
        .query_map(params![id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare_cached(
        "SELECT identity FROM request_decliners WHERE request_id = ?1 ORDER BY position",
    )?;
    let decliners = stmt
        .query_map(params![id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DispatchRequest {
        kind: row.kind.parse().map_err(StoreError::Corrupt)?,
        origin: GeoPosition::new(row.lat, row.lon)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        id: row.id,
        requester: row.requester,
        note: row.note,
        candidates,
        claimant: row.claimant,
        rejection_count: row.rejection_count.max(0) as u32,
        decliners,
        resolved: row.resolved,
        escalations: row.escalations.max(0) as u32,
        parent_id: row.parent_id,
        created_at: row.created_at.max(0) as u64,
        updated_at: row.updated_at.max(0) as u64,
    })
}

fn load_requests(
    conn: &Connection,
    sql: &str,
    kind: RequestKind,
    identity: &str,
) -> Result<Vec<DispatchRequest>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![kind.as_str(), identity], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    ids.iter().map(|id| load_request(conn, id)).collect()
}

#[async_trait]
impl ResponderStore for SqliteStore {
    async fn put(&self, profile: ResponderProfile) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            write_profile(conn, "INSERT OR REPLACE", &profile)?;
            Ok(())
        })
        .await
    }

    async fn insert(&self, profile: ResponderProfile) -> Result<ResponderProfile, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            write_profile(&tx, "INSERT OR IGNORE", &profile)?;
            let stored = load_profile(&tx, profile.class, &profile.identity)?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn remove(&self, class: ResponderClass, identity: &str) -> Result<(), StoreError> {
        let identity = identity.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM profiles WHERE class = ?1 AND identity = ?2",
                params![class.as_str(), identity],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(
        &self,
        class: ResponderClass,
        identity: &str,
    ) -> Result<ResponderProfile, StoreError> {
        let identity = identity.to_string();
        self.with_conn(move |conn| load_profile(conn, class, &identity))
            .await
    }

    async fn find_in_box(
        &self,
        class: ResponderClass,
        bbox: &BoundingBox,
    ) -> Result<Vec<(String, GeoPosition)>, StoreError> {
        let bbox = *bbox;
        self.with_conn(move |conn| {
            let lon_clause = if bbox.crosses_antimeridian() {
                "(lon >= ?4 OR lon <= ?5)"
            } else {
                "lon BETWEEN ?4 AND ?5"
            };
            let sql = format!(
                "SELECT identity, lat, lon FROM profiles \
                 WHERE class = ?1 AND lat IS NOT NULL AND lon IS NOT NULL \
                 AND lat BETWEEN ?2 AND ?3 AND {} ORDER BY identity",
                lon_clause
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![class.as_str(), bbox.bottom, bbox.top, bbox.left, bbox.right],
                    |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?, r.get::<_, f64>(2)?)),
                )?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(identity, lat, lon)| {
                    GeoPosition::new(lat, lon)
                        .map(|pos| (identity, pos))
                        .map_err(|e| StoreError::Corrupt(e.to_string()))
                })
                .collect()
        })
        .await
    }

    async fn increment(
        &self,
        class: ResponderClass,
        identity: &str,
        field: CounterField,
        delta: u64,
        now: Timestamp,
    ) -> Result<ResponderProfile, StoreError> {
        let identity = identity.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "UPDATE profiles SET {col} = {col} + ?1, updated_at = MAX(?2, updated_at + 1) \
                 WHERE class = ?3 AND identity = ?4",
                col = field.column()
            );
            let changed = conn.execute(&sql, params![ts(delta), ts(now), class.as_str(), identity])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("{}/{}", class, identity)));
            }
            load_profile(conn, class, &identity)
        })
        .await
    }

    async fn set_fields(
        &self,
        class: ResponderClass,
        identity: &str,
        fields: ProfileFields,
        now: Timestamp,
    ) -> Result<ResponderProfile, StoreError> {
        let identity = identity.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut profile = load_profile(&tx, class, &identity)?;
            profile.apply(&fields, now.max(profile.updated_at + 1));

            // Counters are left alone so concurrent increments are not lost
            tx.execute(
                "UPDATE profiles SET name = ?1, phone = ?2, designation = ?3, lat = ?4, lon = ?5, \
                 device_handle = ?6, updated_at = ?7 WHERE class = ?8 AND identity = ?9",
                params![
                    profile.info.name,
                    profile.info.phone,
                    profile.info.designation,
                    profile.position.map(|p| p.lat),
                    profile.position.map(|p| p.lon),
                    profile.device_handle,
                    ts(profile.updated_at),
                    class.as_str(),
                    identity,
                ],
            )?;
            let profile = load_profile(&tx, class, &identity)?;
            tx.commit()?;
            Ok(profile)
        })
        .await
    }
}

#[async_trait]
impl RequestStore for SqliteStore {
    async fn create(&self, request: DispatchRequest) -> Result<String, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO requests (id, kind, requester, lat, lon, note, claimant, \
                 rejection_count, candidate_count, resolved, escalations, parent_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    request.id,
                    request.kind.as_str(),
                    request.requester,
                    request.origin.lat,
                    request.origin.lon,
                    request.note,
                    request.claimant,
                    request.rejection_count,
                    request.candidates.len() as i64,
                    request.resolved,
                    request.escalations,
                    request.parent_id,
                    ts(request.created_at),
                    ts(request.updated_at),
                ],
            )?;

            if inserted == 1 {
                let mut stmt = tx.prepare(
                    "INSERT INTO request_candidates (request_id, identity, position) VALUES (?1, ?2, ?3)",
                )?;
                for (position, identity) in request.candidates.iter().enumerate() {
                    stmt.execute(params![request.id, identity, position as i64])?;
                }

                let mut stmt = tx.prepare(
                    "INSERT INTO request_decliners (request_id, identity, position) VALUES (?1, ?2, ?3)",
                )?;
                for (position, identity) in request.decliners.iter().enumerate() {
                    stmt.execute(params![request.id, identity, position as i64])?;
                }
            }
            tx.commit()?;
            Ok(request.id)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<DispatchRequest, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| load_request(conn, &id)).await
    }

    async fn conditional_set_claimant(
        &self,
        id: &str,
        responder: &str,
        now: Timestamp,
    ) -> Result<ClaimOutcome, StoreError> {
        let id = id.to_string();
        let responder = responder.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(
                "UPDATE requests SET claimant = ?2, updated_at = MAX(?3, updated_at + 1) \
                 WHERE id = ?1 AND claimant IS NULL AND resolved = 0",
                params![id, responder, ts(now)],
            )?;
            let request = load_request(&tx, &id)?;
            tx.commit()?;

            Ok(if changed == 1 {
                ClaimOutcome::Claimed(request)
            } else if request.claimant.as_deref() == Some(responder.as_str()) {
                ClaimOutcome::HeldByCaller(request)
            } else if let Some(claimant) = request.claimant.clone() {
                ClaimOutcome::AlreadyClaimed { claimant, request }
            } else {
                ClaimOutcome::Resolved(request)
            })
        })
        .await
    }

    async fn increment_rejection(
        &self,
        id: &str,
        responder: &str,
        now: Timestamp,
    ) -> Result<RejectionOutcome, StoreError> {
        let id = id.to_string();
        let responder = responder.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO request_decliners (request_id, identity, position) \
                 SELECT r.id, ?2, r.rejection_count FROM requests r \
                 WHERE r.id = ?1 AND r.claimant IS NULL AND r.resolved = 0 \
                 AND EXISTS (SELECT 1 FROM request_candidates c \
                             WHERE c.request_id = ?1 AND c.identity = ?2)",
                params![id, responder],
            )?;
            if inserted == 1 {
                tx.execute(
                    "UPDATE requests SET rejection_count = rejection_count + 1, \
                     updated_at = MAX(?2, updated_at + 1) WHERE id = ?1",
                    params![id, ts(now)],
                )?;
            }
            let request = load_request(&tx, &id)?;
            tx.commit()?;

            Ok(if inserted == 1 {
                RejectionOutcome::Counted(request)
            } else if request.resolved {
                RejectionOutcome::Resolved(request)
            } else if request.claimant.is_some() {
                RejectionOutcome::Claimed(request)
            } else if request.has_declined(&responder) {
                RejectionOutcome::AlreadyDeclined(request)
            } else {
                RejectionOutcome::NotCandidate(request)
            })
        })
        .await
    }

    async fn append_candidates(
        &self,
        id: &str,
        candidates: &[String],
        now: Timestamp,
    ) -> Result<AppendOutcome, StoreError> {
        let id = id.to_string();
        let candidates = candidates.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = load_request(&tx, &id)?;
            if current.resolved {
                tx.commit()?;
                return Ok(AppendOutcome {
                    request: current,
                    added: Vec::new(),
                });
            }

            let mut added = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO request_candidates (request_id, identity, position) \
                     VALUES (?1, ?2, (SELECT COALESCE(MAX(position), -1) + 1 \
                     FROM request_candidates WHERE request_id = ?1))",
                )?;
                for identity in &candidates {
                    if stmt.execute(params![id, identity])? == 1 {
                        added.push(identity.clone());
                    }
                }
            }

            if !added.is_empty() {
                tx.execute(
                    "UPDATE requests SET candidate_count = candidate_count + ?2, \
                     escalations = escalations + 1, updated_at = MAX(?3, updated_at + 1) \
                     WHERE id = ?1",
                    params![id, added.len() as i64, ts(now)],
                )?;
            }
            let request = load_request(&tx, &id)?;
            tx.commit()?;
            Ok(AppendOutcome { request, added })
        })
        .await
    }

    async fn set_resolved(&self, id: &str, now: Timestamp) -> Result<ResolveOutcome, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(
                "UPDATE requests SET resolved = 1, updated_at = MAX(?2, updated_at + 1) \
                 WHERE id = ?1 AND resolved = 0",
                params![id, ts(now)],
            )?;
            let request = load_request(&tx, &id)?;
            tx.commit()?;

            Ok(if changed == 1 {
                ResolveOutcome::Resolved(request)
            } else {
                ResolveOutcome::AlreadyResolved(request)
            })
        })
        .await
    }

    async fn list_by_requester(
        &self,
        kind: RequestKind,
        identity: &str,
    ) -> Result<Vec<DispatchRequest>, StoreError> {
        let identity = identity.to_string();
        self.with_conn(move |conn| {
            load_requests(
                conn,
                "SELECT id FROM requests WHERE kind = ?1 AND requester = ?2 \
                 ORDER BY created_at, id",
                kind,
                &identity,
            )
        })
        .await
    }

    async fn list_by_candidate(
        &self,
        kind: RequestKind,
        identity: &str,
    ) -> Result<Vec<DispatchRequest>, StoreError> {
        let identity = identity.to_string();
        self.with_conn(move |conn| {
            load_requests(
                conn,
                "SELECT r.id FROM requests r \
                 JOIN request_candidates c ON c.request_id = r.id \
                 WHERE r.kind = ?1 AND c.identity = ?2 \
                 ORDER BY r.created_at, r.id",
                kind,
                &identity,
            )
        })
        .await
    }
}
