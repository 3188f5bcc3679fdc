//! Replica Threads
//!
//! A replica thread owns a fixed set of peers and repeatedly runs the
//! exchange cycle against each of them: fetch the next batch of metadata
//! beyond the peer's token, work out which blobs are missing locally,
//! fetch them in one call, apply the batch in journal order and only then
//! advance the token. A failure leaves the token where it was so the batch
//! is replayed on the next attempt; apply is idempotent so replay is safe.
//!
//! Threads run as tokio tasks. A pool starts one task per bucket of a
//! [`ReplicationGroup`] and stops them through a shared watch channel.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::group::ReplicationGroup;
use super::metrics::ReplicationMetrics;
use super::protocol::MetadataBatch;
use super::remote_replica::{RemoteReplicaInfo, ReplicaState};
use super::{Backoff, Locality, ReplicaClient, ReplicationConfig, Token};
use crate::cluster::ReplicaId;
use crate::error::{Error, Result};
use crate::store::{BlobId, EntryContent, LocalStore};

/// Lifecycle of one replica thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    /// Stop observed; finishing the current batch
    Stopping,
    Stopped,
}

impl WorkerState {
    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Starting => 0,
            WorkerState::Running => 1,
            WorkerState::Stopping => 2,
            WorkerState::Stopped => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Starting,
            1 => WorkerState::Running,
            2 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

/// Shared handle on a replica thread's lifecycle, for metrics and the pool
#[derive(Debug)]
pub struct WorkerLifecycle {
    name: String,
    state: AtomicU8,
}

impl WorkerLifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(WorkerState::Starting.as_u8()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Spawned and not yet exited
    pub fn is_live(&self) -> bool {
        self.state() != WorkerState::Stopped
    }
}

/// Result of one exchange cycle against one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A non-empty batch was applied and the token advanced
    Applied {
        entries: usize,
        blobs: u64,
        bytes: u64,
        deletes: usize,
        skipped: usize,
    },
    /// The peer had nothing beyond our token
    InSync,
    /// The peer does not host the partition; nothing was touched
    UnknownPartition,
    /// Still waiting out the backoff of an earlier failure
    BackingOff,
    /// The peer left the cluster map
    Disabled,
    /// The cycle failed; the token was left in place
    Failed,
    /// Shutdown arrived before anything was applied
    Cancelled,
}

impl CycleOutcome {
    pub fn made_progress(&self) -> bool {
        matches!(self, CycleOutcome::Applied { .. })
    }
}

struct PeerSlot {
    info: Arc<RemoteReplicaInfo>,
    backoff: Backoff,
}

/// Everything a cycle needs besides the peer itself
struct CycleContext {
    name: String,
    locality: Locality,
    config: ReplicationConfig,
    client: Arc<dyn ReplicaClient>,
    store: Arc<dyn LocalStore>,
    metrics: Arc<ReplicationMetrics>,
}

/// Worker replicating from a fixed set of peers
pub struct ReplicaThread {
    ctx: CycleContext,
    peers: Vec<PeerSlot>,
    lifecycle: Arc<WorkerLifecycle>,
    shutdown: watch::Receiver<bool>,
}

impl ReplicaThread {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        locality: Locality,
        config: ReplicationConfig,
        peers: Vec<Arc<RemoteReplicaInfo>>,
        client: Arc<dyn ReplicaClient>,
        store: Arc<dyn LocalStore>,
        metrics: Arc<ReplicationMetrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let name = name.into();
        let peers = peers
            .into_iter()
            .map(|info| PeerSlot {
                info,
                backoff: config.new_backoff(),
            })
            .collect();
        Self {
            lifecycle: Arc::new(WorkerLifecycle::new(name.clone())),
            ctx: CycleContext {
                name,
                locality,
                config,
                client,
                store,
                metrics,
            },
            peers,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn lifecycle(&self) -> Arc<WorkerLifecycle> {
        Arc::clone(&self.lifecycle)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Arc<RemoteReplicaInfo>> {
        self.peers.iter().map(|slot| &slot.info)
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run rounds until shutdown is signalled
    pub async fn run(mut self) {
        self.lifecycle.set(WorkerState::Running);
        tracing::info!(
            "Replica thread {} started with {} peer(s)",
            self.ctx.name,
            self.peers.len()
        );

        let lifecycle = Arc::clone(&self.lifecycle);
        let name = self.ctx.name.clone();
        let stopping = move || {
            if lifecycle.state() == WorkerState::Running {
                lifecycle.set(WorkerState::Stopping);
                tracing::info!("Replica thread {} stopping", name);
            }
        };

        loop {
            if self.stop_requested() {
                break;
            }

            // Stop is observed mid-round; the in-flight batch still completes
            let mut shutdown = self.shutdown.clone();
            let outcomes = {
                let round = self.run_round();
                tokio::pin!(round);
                tokio::select! {
                    outcomes = &mut round => outcomes,
                    _ = wait_for_stop(&mut shutdown) => {
                        stopping();
                        round.await
                    }
                }
            };
            if self.stop_requested() {
                break;
            }

            // Keep draining while any peer is behind
            if !outcomes.iter().any(CycleOutcome::made_progress) {
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(self.ctx.config.round_interval) => {}
                    _ = wait_for_stop(&mut shutdown) => {}
                }
            }
        }

        stopping();
        self.lifecycle.set(WorkerState::Stopped);
        tracing::info!("Replica thread {} stopped", self.ctx.name);
    }

    /// One pass over every assigned peer
    pub async fn run_round(&mut self) -> Vec<CycleOutcome> {
        let count = self.peers.len();
        let mut outcomes = Vec::with_capacity(count);

        for (i, slot) in self.peers.iter_mut().enumerate() {
            if *self.shutdown.borrow() {
                break;
            }
            outcomes.push(self.ctx.replicate(slot, &self.shutdown).await);

            if !self.ctx.config.peer_pacing.is_zero() && i + 1 < count {
                tokio::time::sleep(self.ctx.config.peer_pacing).await;
            }
        }

        outcomes
    }

    /// Run a single cycle against the peer at `index`
    pub async fn replicate_peer(&mut self, index: usize) -> Option<CycleOutcome> {
        let slot = self.peers.get_mut(index)?;
        Some(self.ctx.replicate(slot, &self.shutdown).await)
    }
}

impl CycleContext {
    async fn replicate(&self, slot: &mut PeerSlot, shutdown: &watch::Receiver<bool>) -> CycleOutcome {
        let info = Arc::clone(&slot.info);
        if info.is_disabled() {
            return CycleOutcome::Disabled;
        }
        if let Some(wait) = slot.backoff.remaining(Instant::now()) {
            tracing::trace!(
                "{}: {} backing off for another {}ms",
                self.name,
                info.replica_id(),
                wait.as_millis()
            );
            return CycleOutcome::BackingOff;
        }

        let peer = info.replica_id();
        let partition = info.partition();
        let token = info.token();

        // Exchange
        let started = Instant::now();
        let batch = match self
            .call(peer, shutdown, self.client.exchange_metadata(peer, token, self.config.limits))
            .await
        {
            Ok(batch) => batch,
            Err(Error::UnknownPartition(_)) => return self.unknown_partition(&info),
            Err(Error::Cancelled) => return CycleOutcome::Cancelled,
            Err(e) => return self.fail(slot, e),
        };
        self.metrics
            .record_exchange_latency(self.locality, started.elapsed());

        if batch.partition != partition {
            return self.unknown_partition(&info);
        }
        if let Err(e) = self.validate(token, &batch) {
            return self.fail(slot, e);
        }

        // Diff
        let mut wanted = HashSet::new();
        let mut missing = Vec::new();
        for entry in batch.entries.iter().filter(|e| !e.deleted) {
            if wanted.contains(&entry.id) {
                continue;
            }
            match self.store.exists(partition, &entry.id).await {
                Ok(true) => {}
                Ok(false) => {
                    wanted.insert(entry.id.clone());
                    missing.push(entry.id.clone());
                }
                Err(Error::UnknownPartition(_)) => return self.unknown_partition(&info),
                Err(e) => return self.fail(slot, e),
            }
        }

        // Fetch
        let mut fetched: HashMap<BlobId, EntryContent> = HashMap::new();
        if !missing.is_empty() {
            match self
                .call(peer, shutdown, self.client.get_missing(peer, partition, missing.clone()))
                .await
            {
                Ok(contents) => {
                    for content in contents {
                        if wanted.contains(&content.id) {
                            fetched.insert(content.id.clone(), content);
                        }
                    }
                }
                Err(Error::UnknownPartition(_)) => return self.unknown_partition(&info),
                Err(Error::Cancelled) => return CycleOutcome::Cancelled,
                Err(e) => return self.fail(slot, e),
            }
        }

        // Apply in journal order; from here on shutdown waits for the batch
        let mut blobs = 0u64;
        let mut bytes = 0u64;
        let mut deletes = 0usize;
        let mut skipped = 0usize;
        for entry in &batch.entries {
            if entry.deleted {
                if let Err(e) = self.store.delete(partition, &entry.id).await {
                    return self.fail(slot, e);
                }
                deletes += 1;
                continue;
            }
            if !wanted.remove(&entry.id) {
                continue;
            }

            let content = match fetched.remove(&entry.id) {
                Some(content) => content,
                None => {
                    self.entry_error(&info, &entry.id, "absent from fetch response");
                    skipped += 1;
                    continue;
                }
            };
            if let Err(e) = content.verify() {
                self.entry_error(&info, &entry.id, &e.to_string());
                skipped += 1;
                continue;
            }
            if content.partition != partition {
                self.entry_error(&info, &entry.id, "content for another partition");
                skipped += 1;
                continue;
            }

            if let Err(e) = self.store.put(&content).await {
                return self.fail(slot, e);
            }
            blobs += 1;
            bytes += content.size();
        }

        // Commit
        if let Err(e) = info.set_token(batch.new_token) {
            return self.fail(slot, e);
        }
        info.update_lag(batch.log_end);
        slot.backoff.on_success();
        if blobs > 0 {
            self.metrics.record_replicated(self.locality, bytes, blobs);
        }
        let state = if missing.is_empty() && deletes == 0 {
            ReplicaState::InSync
        } else {
            ReplicaState::CatchingUp
        };
        info.record_success(state);

        if batch.entries.is_empty() {
            return CycleOutcome::InSync;
        }

        tracing::debug!(
            "{}: applied {} entries from {} (partition {}, {} blobs, {} bytes, {} deletes, {} skipped), token {} -> {}",
            self.name,
            batch.entries.len(),
            peer,
            partition,
            blobs,
            bytes,
            deletes,
            skipped,
            token,
            batch.new_token
        );

        CycleOutcome::Applied {
            entries: batch.entries.len(),
            blobs,
            bytes,
            deletes,
            skipped,
        }
    }

    /// Reject batches that cannot have come from a sane peer
    fn validate(&self, token: Token, batch: &MetadataBatch) -> Result<()> {
        if batch.new_token < token {
            return Err(Error::Protocol(format!(
                "peer returned token {} behind requested {}",
                batch.new_token, token
            )));
        }
        if batch.entries.len() > self.config.limits.max_entries {
            return Err(Error::Protocol(format!(
                "peer returned {} entries, limit is {}",
                batch.entries.len(),
                self.config.limits.max_entries
            )));
        }
        Ok(())
    }

    /// Race a peer call against the request timeout and shutdown
    async fn call<T>(
        &self,
        peer: &ReplicaId,
        shutdown: &watch::Receiver<bool>,
        request: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let mut shutdown = shutdown.clone();
        tokio::select! {
            result = timeout(self.config.request_timeout, request) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectionTimeout(peer.node().address())),
            },
            _ = wait_for_stop(&mut shutdown) => Err(Error::Cancelled),
        }
    }

    /// Either side no longer hosts the partition
    fn unknown_partition(&self, info: &RemoteReplicaInfo) -> CycleOutcome {
        self.metrics.record_unknown_remote_replica();
        tracing::debug!(
            "{}: partition {} is not hosted on both {} and {}",
            self.name,
            info.partition(),
            info.local_replica().node(),
            info.replica_id().node()
        );
        CycleOutcome::UnknownPartition
    }

    fn entry_error(&self, info: &RemoteReplicaInfo, id: &BlobId, reason: &str) {
        info.record_entry_error();
        self.metrics.record_error();
        tracing::warn!(
            "{}: skipping blob {} from {}: {}",
            self.name,
            id,
            info.replica_id(),
            reason
        );
    }

    fn fail(&self, slot: &mut PeerSlot, error: Error) -> CycleOutcome {
        let failures = slot.info.record_failure();
        self.metrics.record_error();
        let delay = slot.backoff.on_failure(Instant::now());
        if error.is_protocol() {
            tracing::error!(
                "{}: peer {} sent a malformed batch ({} in a row, retry in {}ms): {}",
                self.name,
                slot.info.replica_id(),
                failures,
                delay.as_millis(),
                error
            );
        } else {
            tracing::warn!(
                "{}: cycle against {} failed ({} in a row, retry in {}ms): {}",
                self.name,
                slot.info.replica_id(),
                failures,
                delay.as_millis(),
                error
            );
        }
        CycleOutcome::Failed
    }
}

/// Resolve once the watch carries `true`; never resolves if the sender is
/// dropped without signalling
async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// The running replica threads of one locality
pub struct ReplicaThreadPool {
    locality: Locality,
    shutdown: watch::Sender<bool>,
    workers: Vec<(Arc<WorkerLifecycle>, JoinHandle<()>)>,
}

impl ReplicaThreadPool {
    /// Spawn one thread per non-empty bucket of `group`
    pub fn start(
        group: &ReplicationGroup,
        config: &ReplicationConfig,
        client: Arc<dyn ReplicaClient>,
        store: Arc<dyn LocalStore>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(group.buckets().len());

        for (i, bucket) in group.buckets().iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let thread = ReplicaThread::new(
                format!("{}-{}", group.locality(), i),
                group.locality(),
                config.clone(),
                bucket.clone(),
                Arc::clone(&client),
                Arc::clone(&store),
                Arc::clone(&metrics),
                rx.clone(),
            );
            let lifecycle = thread.lifecycle();
            workers.push((lifecycle, tokio::spawn(thread.run())));
        }

        tracing::info!(
            "Started {} {} replica thread(s) for {} peer(s)",
            workers.len(),
            group.locality(),
            group.peer_count()
        );

        Self {
            locality: group.locality(),
            shutdown: tx,
            workers,
        }
    }

    pub fn locality(&self) -> Locality {
        self.locality
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn lifecycles(&self) -> Vec<Arc<WorkerLifecycle>> {
        self.workers.iter().map(|(l, _)| Arc::clone(l)).collect()
    }

    /// Signal every thread and wait up to `grace` for them to finish their
    /// current batch. Threads still running after that are aborted.
    pub async fn shutdown(mut self, grace: Duration) -> Result<()> {
        let _ = self.shutdown.send(true);

        let joined = timeout(
            grace,
            join_all(self.workers.iter_mut().map(|(_, handle)| handle)),
        )
        .await;
        if let Ok(results) = joined {
            for ((lifecycle, _), result) in self.workers.iter().zip(results) {
                if let Err(e) = result {
                    tracing::error!("Replica thread {} ended abnormally: {}", lifecycle.name(), e);
                    lifecycle.set(WorkerState::Stopped);
                }
            }
            tracing::info!("Stopped {} {} replica thread(s)", self.workers.len(), self.locality);
            return Ok(());
        }

        let mut remaining = 0;
        for (lifecycle, handle) in &self.workers {
            if !handle.is_finished() {
                handle.abort();
                lifecycle.set(WorkerState::Stopped);
                remaining += 1;
            }
        }
        tracing::error!(
            "{} {} replica thread(s) did not stop within {:?}",
            remaining,
            self.locality,
            grace
        );
        Err(Error::ShutdownTimeout { remaining })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PartitionId;
    use crate::replication::testing::*;
    use crate::store::MemoryStore;

    const P: PartitionId = PartitionId(1);

    struct Harness {
        local: Arc<MemoryStore>,
        metrics: Arc<ReplicationMetrics>,
        _stop: watch::Sender<bool>,
        thread: ReplicaThread,
    }

    fn harness(
        peers: Vec<Arc<RemoteReplicaInfo>>,
        cluster: MockCluster,
        store: Option<Arc<dyn LocalStore>>,
        config: ReplicationConfig,
    ) -> Harness {
        let local = Arc::new(MemoryStore::with_partitions([P]));
        let store = store.unwrap_or_else(|| Arc::clone(&local) as Arc<dyn LocalStore>);
        let metrics = Arc::new(ReplicationMetrics::new("test"));
        let (tx, rx) = watch::channel(false);
        let thread = ReplicaThread::new(
            "intra-colo-0",
            Locality::IntraColo,
            config,
            peers,
            Arc::new(cluster),
            store,
            Arc::clone(&metrics),
            rx,
        );
        Harness {
            local,
            metrics,
            _stop: tx,
            thread,
        }
    }

    #[tokio::test]
    async fn test_catch_up_from_empty() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[1]);
        peer.write(1, "d1", b"one").await;
        peer.write(1, "d2", b"two").await;
        let end = peer.write(1, "d3", b"three").await;

        let info = remote_info(1, &a, &b);
        let mut h = harness(
            vec![Arc::clone(&info)],
            MockCluster::new().with_peer(&b, Arc::clone(&peer)),
            None,
            test_config(),
        );

        let outcome = h.thread.replicate_peer(0).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Applied {
                entries: 3,
                blobs: 3,
                bytes: 11,
                deletes: 0,
                skipped: 0
            }
        );
        assert_eq!(info.token(), end);
        assert_eq!(info.lag_in_bytes(), 0);
        assert_eq!(info.state(), ReplicaState::CatchingUp);
        assert_eq!(h.local.contents(P).await, peer.store.contents(P).await);
        assert_eq!(h.metrics.blobs_replicated(Locality::IntraColo), 3);
        assert_eq!(h.metrics.replication_bytes(Locality::IntraColo), 11);
        assert_eq!(peer.fetch_calls.load(Ordering::SeqCst), 1);

        // Nothing new: the peer is in sync and no fetch happens
        assert_eq!(h.thread.replicate_peer(0).await.unwrap(), CycleOutcome::InSync);
        assert_eq!(info.state(), ReplicaState::InSync);
        assert_eq!(peer.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(info.token(), end);
    }

    #[tokio::test]
    async fn test_replay_after_crash_only_fetches_missing() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[1]);
        peer.write(1, "d1", b"one").await;
        peer.write(1, "d2", b"two").await;
        peer.write(1, "d3", b"three").await;

        let info = remote_info(1, &a, &b);
        let mut h = harness(
            vec![Arc::clone(&info)],
            MockCluster::new().with_peer(&b, Arc::clone(&peer)),
            None,
            test_config(),
        );

        // d1 was applied before the crash; the checkpoint still says T0
        h.local
            .put(&EntryContent::new(P, "d1".into(), b"one".to_vec(), false))
            .await
            .unwrap();

        let outcome = h.thread.replicate_peer(0).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Applied { entries: 3, blobs: 2, .. }));
        assert_eq!(peer.fetched_ids.load(Ordering::SeqCst), 2);
        assert_eq!(h.local.contents(P).await, peer.store.contents(P).await);

        // Replaying the whole journal again changes nothing
        info.reset_token();
        let outcome = h.thread.replicate_peer(0).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Applied { blobs: 0, skipped: 0, .. }));
        assert_eq!(info.state(), ReplicaState::InSync);
        assert_eq!(h.local.contents(P).await, peer.store.contents(P).await);
        assert_eq!(h.metrics.replication_errors(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_isolated() {
        let a = node("a", "dc1");
        let (b, c, d) = (node("b", "dc1"), node("c", "dc1"), node("d", "dc1"));
        let peer_b = InMemoryPeer::hosting(&[1]);
        let peer_c = InMemoryPeer::hosting(&[1]);
        let peer_d = InMemoryPeer::hosting(&[1]);
        peer_c.set_unreachable(true);

        let infos = vec![remote_info(1, &a, &b), remote_info(1, &a, &c), remote_info(1, &a, &d)];
        let cluster = MockCluster::new()
            .with_peer(&b, Arc::clone(&peer_b))
            .with_peer(&c, Arc::clone(&peer_c))
            .with_peer(&d, Arc::clone(&peer_d));
        let mut h = harness(infos.clone(), cluster, None, test_config());

        for round in 0..3 {
            let id = format!("blob-{}", round);
            peer_b.write(1, &id, b"from-b").await;
            peer_d.write(1, &format!("{}-d", id), b"from-d").await;

            let outcomes = h.thread.run_round().await;
            assert!(outcomes[0].made_progress());
            assert_eq!(outcomes[1], CycleOutcome::Failed);
            assert!(outcomes[2].made_progress());
            assert!(h.local.exists(P, &BlobId::from(id.as_str())).await.unwrap());

            // Let the capped backoff expire before the next round
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(infos[1].error_count(), 3);
        assert_eq!(infos[1].consecutive_failures(), 3);
        assert_eq!(infos[1].state(), ReplicaState::Error);
        assert!(infos[1].token().is_initial());
        assert_eq!(h.thread.peers[1].backoff.failures(), 3);
        assert_eq!(h.metrics.replication_errors(), 3);
        assert_eq!(infos[0].error_count(), 0);
        assert_eq!(infos[2].error_count(), 0);

        // Recovery clears the failure streak but keeps the error count
        peer_c.set_unreachable(false);
        assert_eq!(h.thread.replicate_peer(1).await.unwrap(), CycleOutcome::InSync);
        assert_eq!(infos[1].consecutive_failures(), 0);
        assert_eq!(infos[1].error_count(), 3);
        assert_eq!(infos[1].state(), ReplicaState::InSync);
    }

    #[tokio::test]
    async fn test_hung_peer_times_out_without_blocking_others() {
        let a = node("a", "dc1");
        let (b, c) = (node("b", "dc1"), node("c", "dc1"));
        let peer_b = InMemoryPeer::hosting(&[1]);
        let peer_c = InMemoryPeer::hosting(&[1]);
        peer_c.set_hang(true);
        peer_b.write(1, "x", b"payload").await;

        let infos = vec![remote_info(1, &a, &c), remote_info(1, &a, &b)];
        let cluster = MockCluster::new()
            .with_peer(&b, Arc::clone(&peer_b))
            .with_peer(&c, Arc::clone(&peer_c));
        let mut config = test_config();
        config.request_timeout = Duration::from_millis(50);
        let mut h = harness(infos.clone(), cluster, None, config);

        let outcomes = h.thread.run_round().await;
        assert_eq!(outcomes[0], CycleOutcome::Failed);
        assert!(outcomes[1].made_progress());
        assert_eq!(infos[0].state(), ReplicaState::Error);
        assert!(h.local.exists(P, &"x".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_backoff_skips_peer_until_due() {
        let (a, c) = (node("a", "dc1"), node("c", "dc1"));
        let peer_c = InMemoryPeer::hosting(&[1]);
        peer_c.set_unreachable(true);

        let mut config = test_config();
        config.backoff_base = Duration::from_secs(60);
        config.backoff_max = Duration::from_secs(60);
        let mut h = harness(
            vec![remote_info(1, &a, &c)],
            MockCluster::new().with_peer(&c, Arc::clone(&peer_c)),
            None,
            config,
        );

        assert_eq!(h.thread.replicate_peer(0).await.unwrap(), CycleOutcome::Failed);
        assert_eq!(h.thread.replicate_peer(0).await.unwrap(), CycleOutcome::BackingOff);
        assert_eq!(peer_c.exchange_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_peer_without_partition_is_a_no_op() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[2]);
        let info = remote_info(1, &a, &b);
        let mut h = harness(
            vec![Arc::clone(&info)],
            MockCluster::new().with_peer(&b, Arc::clone(&peer)),
            None,
            test_config(),
        );

        assert_eq!(
            h.thread.replicate_peer(0).await.unwrap(),
            CycleOutcome::UnknownPartition
        );
        assert_eq!(h.metrics.unknown_remote_replica_requests(), 1);
        assert_eq!(h.metrics.replication_errors(), 0);
        assert_eq!(h.local.journal_len(P).await, 0);
        assert!(info.token().is_initial());
        assert_eq!(info.state(), ReplicaState::CatchingUp);
        assert_eq!(info.error_count(), 0);
    }

    #[tokio::test]
    async fn test_partition_not_hosted_locally_is_a_no_op() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[7]);
        peer.write(7, "b1", b"one").await;
        let info = remote_info(7, &a, &b);
        let mut h = harness(
            vec![Arc::clone(&info)],
            MockCluster::new().with_peer(&b, Arc::clone(&peer)),
            None,
            test_config(),
        );

        assert_eq!(
            h.thread.replicate_peer(0).await.unwrap(),
            CycleOutcome::UnknownPartition
        );
        assert_eq!(h.metrics.unknown_remote_replica_requests(), 1);
        assert_eq!(h.metrics.replication_errors(), 0);
        assert_eq!(info.state(), ReplicaState::CatchingUp);
        assert_eq!(info.error_count(), 0);
        assert!(info.token().is_initial());
        assert_eq!(peer.fetch_calls.load(Ordering::SeqCst), 0);

        // No backoff was scheduled
        assert_eq!(
            h.thread.replicate_peer(0).await.unwrap(),
            CycleOutcome::UnknownPartition
        );
        assert_eq!(h.metrics.unknown_remote_replica_requests(), 2);
    }

    #[tokio::test]
    async fn test_large_backlog_drains_in_capped_batches() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[1]);
        for i in 0..350 {
            peer.write(1, &format!("blob-{:04}", i), b"0123456789").await;
        }
        let info = remote_info(1, &a, &b);
        let mut h = harness(
            vec![Arc::clone(&info)],
            MockCluster::new().with_peer(&b, Arc::clone(&peer)),
            None,
            test_config(),
        );

        let mut sizes = Vec::new();
        let mut previous = info.token();
        loop {
            match h.thread.replicate_peer(0).await.unwrap() {
                CycleOutcome::Applied { entries, .. } => {
                    assert!(info.token() > previous);
                    previous = info.token();
                    sizes.push(entries);
                }
                CycleOutcome::InSync => break,
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(sizes, vec![100, 100, 100, 50]);
        assert_eq!(info.lag_in_bytes(), 0);
        assert_eq!(h.local.contents(P).await.len(), 350);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_skips_only_that_blob() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[1]);
        peer.write(1, "b1", b"one").await;
        peer.write(1, "b2", b"two").await;
        let end = peer.write(1, "b3", b"three").await;
        peer.corrupt("b2");

        let info = remote_info(1, &a, &b);
        let mut h = harness(
            vec![Arc::clone(&info)],
            MockCluster::new().with_peer(&b, Arc::clone(&peer)),
            None,
            test_config(),
        );

        let outcome = h.thread.replicate_peer(0).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Applied { blobs: 2, skipped: 1, .. }));
        assert!(h.local.exists(P, &"b1".into()).await.unwrap());
        assert!(!h.local.exists(P, &"b2".into()).await.unwrap());
        assert!(h.local.exists(P, &"b3".into()).await.unwrap());
        assert_eq!(info.token(), end);
        assert_eq!(info.error_count(), 1);
        assert_eq!(h.metrics.replication_errors(), 1);
    }

    #[tokio::test]
    async fn test_withheld_content_is_skipped() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[1]);
        peer.write(1, "b1", b"one").await;
        peer.write(1, "b2", b"two").await;
        peer.withhold("b1");

        let info = remote_info(1, &a, &b);
        let mut h = harness(
            vec![Arc::clone(&info)],
            MockCluster::new().with_peer(&b, Arc::clone(&peer)),
            None,
            test_config(),
        );

        let outcome = h.thread.replicate_peer(0).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Applied { blobs: 1, skipped: 1, .. }));
        assert!(h.local.exists(P, &"b2".into()).await.unwrap());
        assert_eq!(info.error_count(), 1);
    }

    #[tokio::test]
    async fn test_apply_failure_keeps_token_for_replay() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[1]);
        peer.write(1, "b1", b"one").await;
        peer.write(1, "b2", b"two").await;
        let end = peer.write(1, "b3", b"three").await;

        let local = Arc::new(MemoryStore::with_partitions([P]));
        let faulty = FaultyStore::new(Arc::clone(&local));
        faulty.fail_put("b2");

        let info = remote_info(1, &a, &b);
        let mut h = harness(
            vec![Arc::clone(&info)],
            MockCluster::new().with_peer(&b, Arc::clone(&peer)),
            Some(Arc::clone(&faulty) as Arc<dyn LocalStore>),
            test_config(),
        );

        assert_eq!(h.thread.replicate_peer(0).await.unwrap(), CycleOutcome::Failed);
        assert!(info.token().is_initial());
        assert_eq!(info.state(), ReplicaState::Error);
        assert!(local.exists(P, &"b1".into()).await.unwrap());
        assert!(!local.exists(P, &"b3".into()).await.unwrap());

        faulty.heal();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let outcome = h.thread.replicate_peer(0).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Applied { blobs: 2, .. }));
        assert_eq!(info.token(), end);
        assert_eq!(local.contents(P).await, peer.store.contents(P).await);
    }

    #[tokio::test]
    async fn test_deletes_are_replicated() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[1]);
        peer.write(1, "keep", b"kept").await;
        peer.write(1, "gone", b"soon deleted").await;
        peer.store.delete_blob(P, "gone").await.unwrap();

        let info = remote_info(1, &a, &b);
        let mut h = harness(
            vec![Arc::clone(&info)],
            MockCluster::new().with_peer(&b, Arc::clone(&peer)),
            None,
            test_config(),
        );

        let outcome = h.thread.replicate_peer(0).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Applied { deletes: 1, .. }));
        assert_eq!(h.local.get(P, &"gone".into()).await.map(|(_, d)| d), Some(true));
        assert_eq!(h.local.get(P, &"keep".into()).await.map(|(_, d)| d), Some(false));
    }

    struct RegressingClient;

    #[async_trait::async_trait]
    impl ReplicaClient for RegressingClient {
        async fn exchange_metadata(
            &self,
            peer: &ReplicaId,
            token: Token,
            _limits: crate::replication::BatchLimits,
        ) -> Result<MetadataBatch> {
            Ok(MetadataBatch {
                partition: peer.partition(),
                entries: Vec::new(),
                new_token: Token::new(token.offset() / 2),
                log_end: 0,
            })
        }

        async fn get_missing(
            &self,
            _peer: &ReplicaId,
            _partition: PartitionId,
            _ids: Vec<BlobId>,
        ) -> Result<Vec<EntryContent>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_token_regression_from_peer_is_rejected() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let info = remote_info(1, &a, &b);
        info.restore_token(Token::new(100));

        let metrics = Arc::new(ReplicationMetrics::new("test"));
        let (_tx, rx) = watch::channel(false);
        let mut thread = ReplicaThread::new(
            "intra-colo-0",
            Locality::IntraColo,
            test_config(),
            vec![Arc::clone(&info)],
            Arc::new(RegressingClient),
            Arc::new(MemoryStore::with_partitions([P])),
            metrics,
            rx,
        );

        assert_eq!(thread.replicate_peer(0).await.unwrap(), CycleOutcome::Failed);
        assert_eq!(info.token(), Token::new(100));
        assert_eq!(info.state(), ReplicaState::Error);
    }

    #[tokio::test]
    async fn test_disabled_peer_is_skipped() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[1]);
        let info = remote_info(1, &a, &b);
        info.disable();
        let mut h = harness(
            vec![Arc::clone(&info)],
            MockCluster::new().with_peer(&b, Arc::clone(&peer)),
            None,
            test_config(),
        );

        assert_eq!(h.thread.replicate_peer(0).await.unwrap(), CycleOutcome::Disabled);
        assert_eq!(peer.exchange_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pool_replicates_and_stops() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[1]);
        let end = peer.write(1, "b1", b"one").await;

        let info = remote_info(1, &a, &b);
        let group = ReplicationGroup::assign(Locality::IntraColo, 2, &[Arc::clone(&info)]);
        let local = Arc::new(MemoryStore::with_partitions([P]));
        let metrics = Arc::new(ReplicationMetrics::new("test"));
        let pool = ReplicaThreadPool::start(
            &group,
            &test_config(),
            Arc::new(MockCluster::new().with_peer(&b, Arc::clone(&peer))),
            Arc::clone(&local) as Arc<dyn LocalStore>,
            Arc::clone(&metrics),
        );
        assert_eq!(pool.len(), 1);
        let lifecycles = pool.lifecycles();
        metrics.register_workers(lifecycles.clone());

        for _ in 0..100 {
            if info.token() == end {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(info.token(), end);
        assert_eq!(metrics.live_threads(), 1);

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(lifecycles[0].state(), WorkerState::Stopped);
        assert_eq!(metrics.live_threads(), 0);
    }

    #[tokio::test]
    async fn test_pool_shutdown_times_out_on_stuck_apply() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[1]);
        peer.write(1, "b1", b"one").await;

        let local = Arc::new(MemoryStore::with_partitions([P]));
        let slow = FaultyStore::new(Arc::clone(&local));
        slow.delay_puts(Duration::from_secs(30));

        let info = remote_info(1, &a, &b);
        let group = ReplicationGroup::assign(Locality::IntraColo, 1, &[Arc::clone(&info)]);
        let pool = ReplicaThreadPool::start(
            &group,
            &test_config(),
            Arc::new(MockCluster::new().with_peer(&b, Arc::clone(&peer))),
            slow,
            Arc::new(ReplicationMetrics::new("test")),
        );
        let lifecycles = pool.lifecycles();

        // Give the worker time to reach the apply step
        tokio::time::sleep(Duration::from_millis(100)).await;
        match pool.shutdown(Duration::from_millis(50)).await {
            Err(Error::ShutdownTimeout { remaining }) => assert_eq!(remaining, 1),
            other => panic!("expected shutdown timeout, got {:?}", other),
        }
        assert_eq!(lifecycles[0].state(), WorkerState::Stopped);
        assert!(info.token().is_initial());
    }

    #[tokio::test]
    async fn test_stop_during_apply_commits_the_batch() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[1]);
        peer.write(1, "b1", b"one").await;
        let end = peer.write(1, "b2", b"two").await;

        let local = Arc::new(MemoryStore::with_partitions([P]));
        let slow = FaultyStore::new(Arc::clone(&local));
        slow.delay_puts(Duration::from_millis(150));

        let info = remote_info(1, &a, &b);
        let (tx, rx) = watch::channel(false);
        let thread = ReplicaThread::new(
            "intra-colo-0",
            Locality::IntraColo,
            test_config(),
            vec![Arc::clone(&info)],
            Arc::new(MockCluster::new().with_peer(&b, Arc::clone(&peer))),
            slow,
            Arc::new(ReplicationMetrics::new("test")),
            rx,
        );
        let lifecycle = thread.lifecycle();
        let handle = tokio::spawn(thread.run());

        // Stop while the first put is still sleeping
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lifecycle.state(), WorkerState::Stopping);
        assert!(lifecycle.is_live());
        assert!(info.token().is_initial());

        handle.await.unwrap();
        assert_eq!(lifecycle.state(), WorkerState::Stopped);
        assert_eq!(info.token(), end);
        assert!(local.exists(P, &"b1".into()).await.unwrap());
        assert!(local.exists(P, &"b2".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_pool_shutdown_waits_for_in_flight_batch() {
        let (a, b) = (node("a", "dc1"), node("b", "dc1"));
        let peer = InMemoryPeer::hosting(&[1]);
        peer.write(1, "b1", b"one").await;
        let end = peer.write(1, "b2", b"two").await;

        let local = Arc::new(MemoryStore::with_partitions([P]));
        let slow = FaultyStore::new(Arc::clone(&local));
        slow.delay_puts(Duration::from_millis(150));

        let info = remote_info(1, &a, &b);
        let group = ReplicationGroup::assign(Locality::IntraColo, 1, &[Arc::clone(&info)]);
        let pool = ReplicaThreadPool::start(
            &group,
            &test_config(),
            Arc::new(MockCluster::new().with_peer(&b, Arc::clone(&peer))),
            slow,
            Arc::new(ReplicationMetrics::new("test")),
        );
        let lifecycles = pool.lifecycles();

        tokio::time::sleep(Duration::from_millis(60)).await;
        pool.shutdown(Duration::from_secs(5)).await.unwrap();

        assert_eq!(lifecycles[0].state(), WorkerState::Stopped);
        assert_eq!(info.token(), end);
        assert_eq!(local.contents(P).await, peer.store.contents(P).await);
    }
}
