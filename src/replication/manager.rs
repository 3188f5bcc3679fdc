//! Replication Manager
//!
//! Owns the lifecycle of the engine on one node: derives the peers of every
//! local replica from the cluster map, restores their tokens, starts the
//! intra-colo and inter-colo pools and the checkpoint loop, re-assigns
//! peers when the map changes, and writes a final checkpoint on shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::checkpoint::{CheckpointManager, CheckpointStore};
use super::group::ReplicationGroup;
use super::metrics::ReplicationMetrics;
use super::remote_replica::{RemoteReplicaInfo, ReplicaKey, ReplicaRegistry};
use super::thread::ReplicaThreadPool;
use super::{Locality, ReplicaClient, ReplicationConfig};
use crate::cluster::{ClusterMap, ReplicaId};
use crate::config::WolfSyncConfig;
use crate::error::{Error, Result};
use crate::store::LocalStore;
use crate::tuning::TunedConfig;

/// Pool policies and timers for the manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub intra_colo: ReplicationConfig,
    pub inter_colo: ReplicationConfig,
    pub checkpoint_interval: Duration,
    pub shutdown_grace: Duration,
}

impl ManagerSettings {
    /// Resolve pool policies, sizing auto-tuned pools from `tuned`
    pub fn from_config(config: &WolfSyncConfig, tuned: &TunedConfig) -> Self {
        Self {
            intra_colo: ReplicationConfig::from_pool(
                &config.replication.intra_colo,
                tuned.intra_colo_threads,
            ),
            inter_colo: ReplicationConfig::from_pool(
                &config.replication.inter_colo,
                tuned.inter_colo_threads,
            ),
            checkpoint_interval: config.checkpoint_interval(),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    fn pool(&self, locality: Locality) -> &ReplicationConfig {
        match locality {
            Locality::IntraColo => &self.intra_colo,
            Locality::InterColo => &self.inter_colo,
        }
    }
}

struct CheckpointTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Replication engine of one node
pub struct ReplicationManager {
    settings: ManagerSettings,
    client: Arc<dyn ReplicaClient>,
    store: Arc<dyn LocalStore>,
    registry: Arc<ReplicaRegistry>,
    metrics: Arc<ReplicationMetrics>,
    checkpoints: Arc<CheckpointManager>,
    /// Running pools; held across a whole stop/reconcile/start sequence
    pools: Mutex<Option<Vec<ReplicaThreadPool>>>,
    checkpoint_task: parking_lot::Mutex<Option<CheckpointTask>>,
}

impl ReplicationManager {
    pub fn new(
        settings: ManagerSettings,
        client: Arc<dyn ReplicaClient>,
        store: Arc<dyn LocalStore>,
        checkpoint_store: Arc<CheckpointStore>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Self {
        let registry = Arc::new(ReplicaRegistry::new());
        let checkpoints = Arc::new(CheckpointManager::new(
            checkpoint_store,
            Arc::clone(&registry),
            Arc::clone(&metrics),
            settings.checkpoint_interval,
            store.instance_id(),
        ));
        Self {
            settings,
            client,
            store,
            registry,
            metrics,
            checkpoints,
            pools: Mutex::new(None),
            checkpoint_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ReplicaRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ReplicationMetrics> {
        &self.metrics
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// Restore tokens and start replicating. Fails if the checkpoint cannot
    /// be read.
    pub async fn start(&self, map: &dyn ClusterMap) -> Result<()> {
        let mut pools = self.pools.lock().await;
        if pools.is_some() {
            return Err(Error::Internal("replication manager already started".into()));
        }

        let created = self.reconcile(map);
        if let Err(e) = self.checkpoints.restore_into(&created).await {
            // Nothing stays registered, so a retried start restores them
            for info in &created {
                self.registry.remove(info.key());
                self.metrics.remove_remote_replica_from_lag_metrics(info.key());
            }
            return Err(e);
        }

        *pools = Some(self.build_pools());

        let (stop, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.checkpoints).run(rx));
        *self.checkpoint_task.lock() = Some(CheckpointTask { stop, handle });

        tracing::info!(
            "Replication started for {} peer replica(s) of {} local replica(s)",
            self.registry.len(),
            map.local_replicas().len()
        );
        Ok(())
    }

    /// Re-assign peers after a cluster map change. The old pools finish
    /// their in-flight batches before the new assignment starts; peers that
    /// stay keep their tokens.
    pub async fn apply_cluster_map(&self, map: &dyn ClusterMap) -> Result<()> {
        let mut pools = self.pools.lock().await;
        let Some(running) = pools.take() else {
            return Err(Error::Internal("replication manager not started".into()));
        };

        let stopped = self.stop_pools(running).await;
        let created = self.reconcile(map);
        *pools = Some(self.build_pools());

        tracing::info!(
            "Cluster map applied: {} peer replica(s), {} new",
            self.registry.len(),
            created.len()
        );
        stopped
    }

    /// Stop the checkpoint loop and every pool, then write a final
    /// checkpoint. Returns [`Error::ShutdownTimeout`] if threads had to be
    /// aborted. A manager that never started leaves the checkpoint alone.
    pub async fn shutdown(&self) -> Result<()> {
        let task = self.checkpoint_task.lock().take();
        let Some(task) = task else {
            tracing::debug!("Replication manager was not running");
            return Ok(());
        };
        let _ = task.stop.send(true);
        if let Err(e) = task.handle.await {
            tracing::warn!("Checkpoint loop ended abnormally: {}", e);
        }

        let running = self.pools.lock().await.take();
        let stopped = match running {
            Some(running) => self.stop_pools(running).await,
            None => Ok(()),
        };

        match self.checkpoints.persist_now().await {
            Ok(count) => tracing::info!("Final checkpoint wrote {} replica token(s)", count),
            Err(e) => tracing::error!("Final checkpoint failed: {}", e),
        }

        stopped
    }

    /// Bring the registry in line with the map; returns the peers that were
    /// created
    fn reconcile(&self, map: &dyn ClusterMap) -> Vec<Arc<RemoteReplicaInfo>> {
        let local_node = map.local_node();
        let mut wanted: BTreeMap<ReplicaKey, (ReplicaId, ReplicaId)> = BTreeMap::new();
        for local in map.local_replicas() {
            for remote in map.peer_replicas(&local) {
                let key = ReplicaKey::new(local.to_string(), remote.to_string());
                wanted.insert(key, (local.clone(), remote));
            }
        }

        for info in self.registry.snapshot() {
            if !wanted.contains_key(info.key()) {
                info.disable();
                self.registry.remove(info.key());
                self.metrics.remove_remote_replica_from_lag_metrics(info.key());
                tracing::info!("Peer {} left the cluster map", info.key());
            }
        }

        let mut created = Vec::new();
        for (key, (local, remote)) in wanted {
            if self.registry.get(&key).is_some() {
                continue;
            }
            let locality = Locality::between(local_node, remote.node());
            let info = Arc::new(RemoteReplicaInfo::new(local, remote, locality));
            self.registry.insert(Arc::clone(&info));
            self.metrics
                .add_remote_replica_to_lag_metrics(Arc::clone(&info));
            tracing::debug!("Tracking {} peer {}", locality, key);
            created.push(info);
        }

        created
    }

    fn build_pools(&self) -> Vec<ReplicaThreadPool> {
        let peers = self.registry.snapshot();
        let mut pools = Vec::new();

        for locality in [Locality::IntraColo, Locality::InterColo] {
            let config = self.settings.pool(locality);
            let group = ReplicationGroup::assign(locality, config.threads, &peers);
            if group.is_empty() {
                continue;
            }
            pools.push(ReplicaThreadPool::start(
                &group,
                config,
                Arc::clone(&self.client),
                Arc::clone(&self.store),
                Arc::clone(&self.metrics),
            ));
        }

        self.metrics
            .register_workers(pools.iter().flat_map(|p| p.lifecycles()).collect());
        pools
    }

    async fn stop_pools(&self, pools: Vec<ReplicaThreadPool>) -> Result<()> {
        let grace = self.settings.shutdown_grace;
        let results = join_all(pools.into_iter().map(|pool| pool.shutdown(grace))).await;

        let mut remaining = 0;
        for result in results {
            match result {
                Ok(()) => {}
                Err(Error::ShutdownTimeout { remaining: r }) => remaining += r,
                Err(e) => return Err(e),
            }
        }
        if remaining > 0 {
            return Err(Error::ShutdownTimeout { remaining });
        }
        Ok(())
    }
}
