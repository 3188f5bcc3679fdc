//! Token Checkpoints
//!
//! Durable snapshot of every peer's token, so a restarted node resumes
//! replication where it left off instead of from the beginning. Each
//! persist replaces the whole previous snapshot inside one transaction.
//!
//! Every record carries the identity of the local store it was taken
//! against. A token only means "everything before this is stored here"
//! for that store, so records from another store identity are ignored at
//! restore and those peers replicate again from the beginning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

use super::metrics::ReplicationMetrics;
use super::remote_replica::{RemoteReplicaInfo, ReplicaKey, ReplicaRegistry};
use super::Token;
use crate::error::{Error, Result};

/// File name of the checkpoint database inside the checkpoint directory
pub const CHECKPOINT_FILE: &str = "replica_tokens.db";

/// Persisted token of one (local, remote) replica pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointRecord {
    pub key: ReplicaKey,
    pub token: Token,
    /// [`crate::store::LocalStore::instance_id`] the token was reached on
    pub store_id: String,
    pub written_at: DateTime<Utc>,
}

/// SQLite-backed token store
pub struct CheckpointStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl CheckpointStore {
    /// Open or create the checkpoint database in `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join(CHECKPOINT_FILE);
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS replica_tokens (
                local_replica TEXT NOT NULL,
                remote_replica TEXT NOT NULL,
                token INTEGER NOT NULL,
                store_id TEXT NOT NULL,
                written_at TEXT NOT NULL,
                PRIMARY KEY (local_replica, remote_replica)
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored snapshot with `records`
    pub async fn persist(&self, records: &[CheckpointRecord]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM replica_tokens", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO replica_tokens (local_replica, remote_replica, token, store_id, written_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for record in records {
                let token = i64::try_from(record.token.offset()).map_err(|_| {
                    Error::Checkpoint(format!("token {} of {} out of range", record.token, record.key))
                })?;
                stmt.execute(params![
                    record.key.local,
                    record.key.remote,
                    token,
                    record.store_id,
                    record.written_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Read the stored snapshot
    pub async fn restore(&self) -> Result<HashMap<ReplicaKey, CheckpointRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT local_replica, remote_replica, token, store_id, written_at FROM replica_tokens",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut records = HashMap::new();
        for row in rows {
            let (local, remote, token, store_id, written_at) = row?;
            let key = ReplicaKey::new(local, remote);
            let token = u64::try_from(token)
                .map_err(|_| Error::Checkpoint(format!("negative token {} for {}", token, key)))?;
            let written_at = DateTime::parse_from_rfc3339(&written_at)
                .map_err(|e| Error::Checkpoint(format!("bad timestamp for {}: {}", key, e)))?
                .with_timezone(&Utc);
            records.insert(
                key.clone(),
                CheckpointRecord {
                    key,
                    token: Token::new(token),
                    store_id,
                    written_at,
                },
            );
        }

        Ok(records)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Checkpoint(format!("SQLite error: {}", e))
    }
}

/// Periodically snapshots the tokens of every registered peer
pub struct CheckpointManager {
    store: Arc<CheckpointStore>,
    registry: Arc<ReplicaRegistry>,
    metrics: Arc<ReplicationMetrics>,
    interval: Duration,
    /// Identity of the local store the tokens are reached on
    store_id: String,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<CheckpointStore>,
        registry: Arc<ReplicaRegistry>,
        metrics: Arc<ReplicationMetrics>,
        interval: Duration,
        store_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            metrics,
            interval,
            store_id: store_id.into(),
        }
    }

    /// Install checkpointed tokens before the first cycle. Peers without a
    /// usable record start from the beginning. Any failure here is fatal.
    pub async fn restore_into(&self, infos: &[Arc<RemoteReplicaInfo>]) -> Result<usize> {
        let started = Instant::now();
        let records = self
            .store
            .restore()
            .await
            .map_err(|e| Error::CheckpointRestore(e.to_string()))?;

        let mut restored = 0;
        let mut stale = 0;
        for info in infos {
            match records.get(info.key()) {
                Some(record) if record.store_id == self.store_id => {
                    info.restore_token(record.token);
                    restored += 1;
                }
                Some(record) => {
                    tracing::debug!(
                        "Ignoring token {} for {} taken against store {}",
                        record.token,
                        info.key(),
                        record.store_id
                    );
                    info.restore_token(Token::initial());
                    stale += 1;
                }
                None => info.restore_token(Token::initial()),
            }
        }

        self.metrics.record_token_restore(started.elapsed());
        if stale > 0 {
            tracing::warn!(
                "{} checkpointed token(s) belong to another local store than {}; those peers replicate from the beginning",
                stale,
                self.store_id
            );
        }
        tracing::info!(
            "Restored {} of {} replica token(s) from {}",
            restored,
            infos.len(),
            self.store.path().display()
        );
        Ok(restored)
    }

    /// Tokens of every registered, non-disabled peer
    pub fn snapshot(&self) -> Vec<CheckpointRecord> {
        let now = Utc::now();
        self.registry
            .snapshot()
            .into_iter()
            .filter(|info| !info.is_disabled())
            .map(|info| CheckpointRecord {
                key: info.key().clone(),
                token: info.token(),
                store_id: self.store_id.clone(),
                written_at: now,
            })
            .collect()
    }

    /// Write one checkpoint now
    pub async fn persist_now(&self) -> Result<usize> {
        let started = Instant::now();
        let records = self.snapshot();
        self.store.persist(&records).await?;
        self.metrics.record_token_persist(started.elapsed());
        tracing::debug!("Checkpointed {} replica token(s)", records.len());
        Ok(records.len())
    }

    /// Checkpoint on every tick until `shutdown` carries `true`
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.persist_now().await {
                        tracing::warn!("Token checkpoint failed, retrying next tick: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Checkpoint loop stopped");
    }
}
