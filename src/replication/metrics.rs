//! Replication metrics
//!
//! Lock-free counters plus latency histograms for the replication engine,
//! and a registry of per-peer lag gauges populated as peers are created.
//! Nothing in here feeds back into replication decisions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::remote_replica::{RemoteReplicaInfo, ReplicaKey};
use super::thread::WorkerLifecycle;
use super::Locality;

/// Latency histogram in microseconds
pub struct LatencyHistogram {
    inner: Mutex<Histogram<u64>>,
}

impl std::fmt::Debug for LatencyHistogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyHistogram")
            .field("count", &self.inner.lock().len())
            .finish()
    }
}

/// Summary of a latency histogram
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let histogram = Histogram::new(3).expect("3 significant figures is a valid precision");
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.inner.lock().saturating_record(micros.max(1));
    }

    pub fn summary(&self) -> LatencySummary {
        let h = self.inner.lock();
        if h.is_empty() {
            return LatencySummary::default();
        }
        LatencySummary {
            count: h.len(),
            mean_us: h.mean(),
            p50_us: h.value_at_quantile(0.5),
            p99_us: h.value_at_quantile(0.99),
            max_us: h.max(),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of every replication metric
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub name: String,
    pub inter_colo_replication_bytes: u64,
    pub intra_colo_replication_bytes: u64,
    pub inter_colo_blobs_replicated: u64,
    pub intra_colo_blobs_replicated: u64,
    pub unknown_remote_replica_requests: u64,
    pub replication_errors: u64,
    pub inter_colo_exchange_latency: LatencySummary,
    pub intra_colo_exchange_latency: LatencySummary,
    pub token_persist_time: LatencySummary,
    pub token_restore_time: LatencySummary,
    pub live_replica_threads: usize,
    pub replica_lag_in_bytes: BTreeMap<String, u64>,
}

/// Metrics for replication
#[derive(Debug)]
pub struct ReplicationMetrics {
    name: String,
    inter_colo_replication_bytes: AtomicU64,
    intra_colo_replication_bytes: AtomicU64,
    inter_colo_blobs_replicated: AtomicU64,
    intra_colo_blobs_replicated: AtomicU64,
    unknown_remote_replica_requests: AtomicU64,
    replication_errors: AtomicU64,
    inter_colo_exchange_latency: LatencyHistogram,
    intra_colo_exchange_latency: LatencyHistogram,
    token_persist_time: LatencyHistogram,
    token_restore_time: LatencyHistogram,
    workers: RwLock<Vec<Arc<WorkerLifecycle>>>,
    replica_lag: RwLock<BTreeMap<ReplicaKey, Arc<RemoteReplicaInfo>>>,
}

impl ReplicationMetrics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inter_colo_replication_bytes: AtomicU64::new(0),
            intra_colo_replication_bytes: AtomicU64::new(0),
            inter_colo_blobs_replicated: AtomicU64::new(0),
            intra_colo_blobs_replicated: AtomicU64::new(0),
            unknown_remote_replica_requests: AtomicU64::new(0),
            replication_errors: AtomicU64::new(0),
            inter_colo_exchange_latency: LatencyHistogram::new(),
            intra_colo_exchange_latency: LatencyHistogram::new(),
            token_persist_time: LatencyHistogram::new(),
            token_restore_time: LatencyHistogram::new(),
            workers: RwLock::new(Vec::new()),
            replica_lag: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn record_replicated(&self, locality: Locality, bytes: u64, blobs: u64) {
        let (b, n) = match locality {
            Locality::IntraColo => (&self.intra_colo_replication_bytes, &self.intra_colo_blobs_replicated),
            Locality::InterColo => (&self.inter_colo_replication_bytes, &self.inter_colo_blobs_replicated),
        };
        b.fetch_add(bytes, Ordering::Relaxed);
        n.fetch_add(blobs, Ordering::Relaxed);
    }

    pub fn record_exchange_latency(&self, locality: Locality, elapsed: Duration) {
        match locality {
            Locality::IntraColo => self.intra_colo_exchange_latency.record(elapsed),
            Locality::InterColo => self.inter_colo_exchange_latency.record(elapsed),
        }
    }

    pub fn record_error(&self) {
        self.replication_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_remote_replica(&self) {
        self.unknown_remote_replica_requests
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_token_persist(&self, elapsed: Duration) {
        self.token_persist_time.record(elapsed);
    }

    pub fn record_token_restore(&self, elapsed: Duration) {
        self.token_restore_time.record(elapsed);
    }

    pub fn replication_bytes(&self, locality: Locality) -> u64 {
        match locality {
            Locality::IntraColo => self.intra_colo_replication_bytes.load(Ordering::Relaxed),
            Locality::InterColo => self.inter_colo_replication_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn blobs_replicated(&self, locality: Locality) -> u64 {
        match locality {
            Locality::IntraColo => self.intra_colo_blobs_replicated.load(Ordering::Relaxed),
            Locality::InterColo => self.inter_colo_blobs_replicated.load(Ordering::Relaxed),
        }
    }

    pub fn replication_errors(&self) -> u64 {
        self.replication_errors.load(Ordering::Relaxed)
    }

    pub fn unknown_remote_replica_requests(&self) -> u64 {
        self.unknown_remote_replica_requests.load(Ordering::Relaxed)
    }

    /// Replace the tracked workers with those of the current assignment
    pub fn register_workers(&self, workers: Vec<Arc<WorkerLifecycle>>) {
        *self.workers.write() = workers;
    }

    /// Workers that have been spawned and not yet exited
    pub fn live_threads(&self) -> usize {
        self.workers.read().iter().filter(|w| w.is_live()).count()
    }

    /// Register the lag gauge of a newly created peer
    pub fn add_remote_replica_to_lag_metrics(&self, info: Arc<RemoteReplicaInfo>) {
        self.replica_lag.write().insert(info.key().clone(), info);
    }

    pub fn remove_remote_replica_from_lag_metrics(&self, key: &ReplicaKey) {
        self.replica_lag.write().remove(key);
    }

    /// Current lag of one peer, if its gauge is registered
    pub fn replica_lag_in_bytes(&self, key: &ReplicaKey) -> Option<u64> {
        self.replica_lag.read().get(key).map(|info| info.lag_in_bytes())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            name: self.name.clone(),
            inter_colo_replication_bytes: self.replication_bytes(Locality::InterColo),
            intra_colo_replication_bytes: self.replication_bytes(Locality::IntraColo),
            inter_colo_blobs_replicated: self.blobs_replicated(Locality::InterColo),
            intra_colo_blobs_replicated: self.blobs_replicated(Locality::IntraColo),
            unknown_remote_replica_requests: self.unknown_remote_replica_requests(),
            replication_errors: self.replication_errors(),
            inter_colo_exchange_latency: self.inter_colo_exchange_latency.summary(),
            intra_colo_exchange_latency: self.intra_colo_exchange_latency.summary(),
            token_persist_time: self.token_persist_time.summary(),
            token_restore_time: self.token_restore_time.summary(),
            live_replica_threads: self.live_threads(),
            replica_lag_in_bytes: self
                .replica_lag
                .read()
                .iter()
                .map(|(key, info)| (key.to_string(), info.lag_in_bytes()))
                .collect(),
        }
    }
}
