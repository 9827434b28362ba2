//! Session and voucher stores
//!
//! The owner state machine only talks to these traits. The in-memory
//! implementations keep CBOR-encoded records behind a `tokio` lock and are
//! used by tests and single-process deployments.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fdo_core::{codec, FdoError, Guid};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::session::ProtocolSession;
use crate::voucher::OwnershipVoucher;

/// Opaque session identifier carried as the bearer token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for SessionId {
    type Err = FdoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| FdoError::unauthorized("bearer token is not a session id"))
    }
}

/// Store failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No live record under this key
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing record
        what: String,
    },
    /// The stored revision moved on since the caller loaded it
    #[error("revision conflict: expected {expected}, found {found}")]
    Conflict {
        /// Revision the caller loaded
        expected: u64,
        /// Revision currently stored
        found: u64,
    },
    /// Encoding or backend failure
    #[error("store backend failure: {message}")]
    Backend {
        /// Description of the failure
        message: String,
    },
}

impl StoreError {
    fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

impl From<StoreError> for FdoError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => FdoError::unauthorized(err.to_string()),
            StoreError::Conflict { .. } => FdoError::sequence(err.to_string()),
            StoreError::Backend { .. } => FdoError::internal(err.to_string()),
        }
    }
}

impl From<FdoError> for StoreError {
    fn from(err: FdoError) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}

/// Persistence for TO2 sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a new session and return its identifier
    async fn create(&self, session: &ProtocolSession) -> Result<SessionId, StoreError>;

    /// Load a live session; expired sessions are `NotFound`
    async fn get(&self, id: &SessionId) -> Result<ProtocolSession, StoreError>;

    /// Replace a session that is still at `expected_revision`
    async fn update(
        &self,
        id: &SessionId,
        expected_revision: u64,
        session: &ProtocolSession,
    ) -> Result<(), StoreError>;

    /// Remove a session; removing a missing session is not an error
    async fn delete(&self, id: &SessionId) -> Result<(), StoreError>;
}

/// Read access to the owner's vouchers
#[async_trait]
pub trait VoucherStore: Send + Sync {
    /// Voucher for a device
    async fn get(&self, guid: &Guid) -> Result<OwnershipVoucher, StoreError>;
}

struct SessionRecord {
    revision: u64,
    expires_at: Instant,
    bytes: Vec<u8>,
}

/// In-memory session store with a fixed time-to-live
#[derive(Clone)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, SessionRecord>>>,
    ttl: Duration,
}

impl MemorySessionStore {
    /// Default session lifetime
    pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

    /// Create a store with the default lifetime
    pub fn new() -> Self {
        Self::with_ttl(Self::DEFAULT_TTL)
    }

    /// Create a store whose sessions expire `ttl` after their last write
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Number of stored sessions, including expired ones not yet purged
    ///
    /// Expired sessions are dropped on the next `create` or on a `get` that
    /// finds them.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the store holds no sessions
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &ProtocolSession) -> Result<SessionId, StoreError> {
        let id = SessionId::new();
        let now = Instant::now();
        let record = SessionRecord {
            revision: session.revision,
            expires_at: now + self.ttl,
            bytes: codec::to_vec(session)?,
        };
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, record| record.expires_at > now);
        let purged = before - sessions.len();
        sessions.insert(id, record);
        debug!(session = %id, purged, "session created");
        Ok(id)
    }

    async fn get(&self, id: &SessionId) -> Result<ProtocolSession, StoreError> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(record) if record.expires_at > Instant::now() => {
                    return Ok(codec::from_slice(&record.bytes)?);
                }
                Some(_) => {}
                None => return Err(StoreError::not_found(format!("session {id}"))),
            }
        }
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(id)
            .is_some_and(|record| record.expires_at <= Instant::now())
        {
            sessions.remove(id);
            debug!(session = %id, "expired session removed");
        }
        Err(StoreError::not_found(format!("session {id}")))
    }

    async fn update(
        &self,
        id: &SessionId,
        expected_revision: u64,
        session: &ProtocolSession,
    ) -> Result<(), StoreError> {
        let bytes = codec::to_vec(session)?;
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .get_mut(id)
            .filter(|record| record.expires_at > Instant::now())
            .ok_or_else(|| StoreError::not_found(format!("session {id}")))?;

        if record.revision != expected_revision {
            return Err(StoreError::Conflict {
                expected: expected_revision,
                found: record.revision,
            });
        }
        record.revision = session.revision;
        record.expires_at = Instant::now() + self.ttl;
        record.bytes = bytes;
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        self.sessions.write().await.remove(id);
        Ok(())
    }
}

/// In-memory voucher store keyed by device GUID
#[derive(Clone, Default)]
pub struct MemoryVoucherStore {
    vouchers: Arc<RwLock<HashMap<Guid, Vec<u8>>>>,
}

impl MemoryVoucherStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the voucher for its device
    pub async fn insert(&self, voucher: &OwnershipVoucher) -> Result<Guid, StoreError> {
        let guid = voucher.guid()?;
        let bytes = codec::to_vec(voucher)?;
        self.vouchers.write().await.insert(guid, bytes);
        Ok(guid)
    }
}

#[async_trait]
impl VoucherStore for MemoryVoucherStore {
    async fn get(&self, guid: &Guid) -> Result<OwnershipVoucher, StoreError> {
        let vouchers = self.vouchers.read().await;
        let bytes = vouchers
            .get(guid)
            .ok_or_else(|| StoreError::not_found(format!("voucher for {guid}")))?;
        Ok(codec::from_slice(bytes)?)
    }
}
