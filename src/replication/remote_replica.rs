//! Remote Replica Tracking
//!
//! Binds a local replica to one peer replica of the same partition and
//! carries everything the engine knows about that peer: the token, lag
//! estimate, health state and error accounting.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::token::TokenCell;
use super::{Locality, Token};
use crate::cluster::{PartitionId, ReplicaId};
use crate::error::{Error, Result};

/// Health of replication from one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    /// The last cycle found missing entries and applied them
    CatchingUp,
    /// The last cycle found nothing missing
    InSync,
    /// The last cycle failed; a retry is scheduled after backoff
    Error,
    /// The peer left the cluster map; terminal
    Disabled,
}

impl ReplicaState {
    fn as_u8(self) -> u8 {
        match self {
            ReplicaState::CatchingUp => 0,
            ReplicaState::InSync => 1,
            ReplicaState::Error => 2,
            ReplicaState::Disabled => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReplicaState::CatchingUp,
            1 => ReplicaState::InSync,
            2 => ReplicaState::Error,
            _ => ReplicaState::Disabled,
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaState::CatchingUp => write!(f, "CATCHING_UP"),
            ReplicaState::InSync => write!(f, "IN_SYNC"),
            ReplicaState::Error => write!(f, "ERROR"),
            ReplicaState::Disabled => write!(f, "DISABLED"),
        }
    }
}

/// Stable key of a (local replica, remote replica) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaKey {
    pub local: String,
    pub remote: String,
}

impl ReplicaKey {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.local, self.remote)
    }
}

/// Point-in-time view of a peer, for the status API
#[derive(Debug, Clone, Serialize)]
pub struct RemoteReplicaStatus {
    pub local_replica: String,
    pub remote_replica: String,
    pub partition: PartitionId,
    pub locality: Locality,
    pub state: ReplicaState,
    pub token: u64,
    pub lag_in_bytes: u64,
    pub last_exchange: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub error_count: u64,
}

/// Replication state for one peer replica
///
/// Every mutable field is written only by the replica thread that owns
/// the peer; other components read them atomically.
#[derive(Debug)]
pub struct RemoteReplicaInfo {
    local: ReplicaId,
    remote: ReplicaId,
    locality: Locality,
    key: ReplicaKey,
    token: TokenCell,
    lag_in_bytes: AtomicU64,
    state: AtomicU8,
    /// Unix millis of the last successful exchange, 0 = never
    last_exchange_ms: AtomicI64,
    consecutive_failures: AtomicU32,
    error_count: AtomicU64,
}

impl RemoteReplicaInfo {
    pub fn new(local: ReplicaId, remote: ReplicaId, locality: Locality) -> Self {
        let key = ReplicaKey::new(local.to_string(), remote.to_string());
        Self {
            local,
            remote,
            locality,
            key,
            token: TokenCell::new(Token::initial()),
            lag_in_bytes: AtomicU64::new(0),
            state: AtomicU8::new(ReplicaState::CatchingUp.as_u8()),
            last_exchange_ms: AtomicI64::new(0),
            consecutive_failures: AtomicU32::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &ReplicaKey {
        &self.key
    }

    /// The local replica being filled
    pub fn local_replica(&self) -> &ReplicaId {
        &self.local
    }

    /// The peer replica being pulled from
    pub fn replica_id(&self) -> &ReplicaId {
        &self.remote
    }

    pub fn partition(&self) -> PartitionId {
        self.local.partition()
    }

    pub fn locality(&self) -> Locality {
        self.locality
    }

    pub fn token(&self) -> Token {
        self.token.load()
    }

    /// Advance the token after a fully applied batch
    pub fn set_token(&self, token: Token) -> Result<()> {
        self.token.advance(token).map_err(|current| Error::TokenRegression {
            replica: self.key.to_string(),
            current: current.offset(),
            proposed: token.offset(),
        })
    }

    /// Install a checkpointed token before the first cycle
    pub fn restore_token(&self, token: Token) {
        self.token.reset(token);
    }

    /// Start over from the beginning of the peer's journal
    pub fn reset_token(&self) {
        self.token.reset(Token::initial());
        self.lag_in_bytes.store(0, Ordering::Release);
    }

    pub fn lag_in_bytes(&self) -> u64 {
        self.lag_in_bytes.load(Ordering::Acquire)
    }

    /// Recompute lag against the peer's journal end
    pub fn update_lag(&self, remote_log_end: u64) {
        let lag = self.token().lag_to(remote_log_end);
        self.lag_in_bytes.store(lag, Ordering::Release);
    }

    pub fn state(&self) -> ReplicaState {
        ReplicaState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition unless the peer is disabled
    fn transition(&self, next: ReplicaState) {
        let disabled = ReplicaState::Disabled.as_u8();
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s != disabled).then_some(next.as_u8())
            });
    }

    pub(crate) fn record_success(&self, state: ReplicaState) {
        self.transition(state);
        self.consecutive_failures.store(0, Ordering::Release);
        self.last_exchange_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Returns the number of consecutive failures including this one
    pub(crate) fn record_failure(&self) -> u32 {
        self.transition(ReplicaState::Error);
        self.error_count.fetch_add(1, Ordering::AcqRel);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Count an isolated entry error that did not fail the cycle
    pub(crate) fn record_entry_error(&self) {
        self.error_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn disable(&self) {
        self.state
            .store(ReplicaState::Disabled.as_u8(), Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.state() == ReplicaState::Disabled
    }

    pub fn last_exchange(&self) -> Option<DateTime<Utc>> {
        match self.last_exchange_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn status(&self) -> RemoteReplicaStatus {
        RemoteReplicaStatus {
            local_replica: self.key.local.clone(),
            remote_replica: self.key.remote.clone(),
            partition: self.partition(),
            locality: self.locality,
            state: self.state(),
            token: self.token().offset(),
            lag_in_bytes: self.lag_in_bytes(),
            last_exchange: self.last_exchange(),
            consecutive_failures: self.consecutive_failures(),
            error_count: self.error_count(),
        }
    }
}

/// Every peer currently replicated from, keyed by replica pair
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    replicas: RwLock<BTreeMap<ReplicaKey, Arc<RemoteReplicaInfo>>>,
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ReplicaKey) -> Option<Arc<RemoteReplicaInfo>> {
        self.replicas.read().get(key).cloned()
    }

    /// Returns false if the pair was already registered
    pub fn insert(&self, info: Arc<RemoteReplicaInfo>) -> bool {
        let mut replicas = self.replicas.write();
        if replicas.contains_key(info.key()) {
            return false;
        }
        replicas.insert(info.key().clone(), info);
        true
    }

    pub fn remove(&self, key: &ReplicaKey) -> Option<Arc<RemoteReplicaInfo>> {
        self.replicas.write().remove(key)
    }

    /// All registered peers, ordered by key
    pub fn snapshot(&self) -> Vec<Arc<RemoteReplicaInfo>> {
        self.replicas.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.replicas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.read().is_empty()
    }
}
