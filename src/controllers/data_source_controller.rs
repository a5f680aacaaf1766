//! PVC data source controller
//!
//! Drains the PVC work queue with a fixed pool of workers. Each key is
//! validated against the current cache contents, never against the object
//! that was enqueued.

use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::Resource;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{split_meta_namespace_key, wait_for_cache_sync, ChangeEvent, ClaimLister, PopulatorLister};
use crate::error::{Error, Result};
use crate::events::EventRecorder;
use crate::metrics::{DataSourceResult, MetricsRecorder};
use crate::queue::WorkQueue;
use crate::reconcilers::data_source;

/// Event reason for a data source no populator handles
pub const UNRECOGNIZED_DATA_SOURCE_REASON: &str = "UnrecognizedDataSourceKind";

/// Event message for a data source no populator handles
pub const UNRECOGNIZED_DATA_SOURCE_MESSAGE: &str =
    "The datasource for this PVC does not match any registered VolumePopulator";

/// Terminal outcome of a sync that needs no retry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The PVC was validated
    Succeeded(DataSourceResult),
    /// The key cannot be processed and is dropped
    Dropped,
}

/// Validates PVC data sources as they change
pub struct DataSourceValidator {
    claims: Arc<dyn ClaimLister>,
    populators: Arc<dyn PopulatorLister>,
    recorder: Arc<dyn EventRecorder>,
    metrics: Arc<dyn MetricsRecorder>,
    queue: WorkQueue,
}

impl DataSourceValidator {
    pub fn new(
        claims: Arc<dyn ClaimLister>,
        populators: Arc<dyn PopulatorLister>,
        recorder: Arc<dyn EventRecorder>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self::with_queue(claims, populators, recorder, metrics, WorkQueue::new("pvc"))
    }

    pub fn with_queue(
        claims: Arc<dyn ClaimLister>,
        populators: Arc<dyn PopulatorLister>,
        recorder: Arc<dyn EventRecorder>,
        metrics: Arc<dyn MetricsRecorder>,
        queue: WorkQueue,
    ) -> Self {
        Self {
            claims,
            populators,
            recorder,
            metrics,
            queue,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Queue the PVC a cache change is about. Deletions are queued too; the
    /// sync notices the PVC is gone and drops the key.
    pub fn enqueue_work(&self, event: &ChangeEvent<PersistentVolumeClaim>) {
        let key = event.key();
        debug!(key = %key, "enqueued for sync");
        self.queue.add(key);
    }

    /// Wait for the caches, then run `workers` workers until `cancel` fires.
    ///
    /// Workers finish their current item before this returns.
    pub async fn run(
        self: Arc<Self>,
        workers: usize,
        sync_handles: Vec<watch::Receiver<bool>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!("Starting volume-data-source-validator controller");

        if !wait_for_cache_sync(&cancel, sync_handles).await {
            self.queue.shut_down();
            if cancel.is_cancelled() {
                return Ok(());
            }
            error!("Cannot sync caches");
            return Err(Error::CacheSync);
        }
        info!("Caches synced, starting {} workers", workers);

        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let validator = self.clone();
                tokio::spawn(async move {
                    while validator.process_next_item().await {}
                    debug!(worker, "worker stopped");
                })
            })
            .collect();

        cancel.cancelled().await;
        info!("Shutting down volume-data-source-validator controller");
        self.queue.shut_down();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker panicked");
            }
        }
        Ok(())
    }

    /// Process one key from the queue. Returns `false` once the queue is
    /// shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.sync_claim_by_key(&key) {
            Ok(_) => self.queue.forget(&key),
            Err(e) if e.is_retryable() => {
                warn!(
                    key = %key,
                    error = %e,
                    requeues = self.queue.num_requeues(&key),
                    "Failed to sync pvc, will retry again"
                );
                self.queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to sync pvc, dropping");
                self.queue.forget(&key);
            }
        }

        self.queue.done(&key);
        true
    }

    /// Validate the PVC behind `key`.
    ///
    /// Errors are retryable; keys that can never succeed are reported as
    /// [`SyncOutcome::Dropped`].
    pub fn sync_claim_by_key(&self, key: &str) -> Result<SyncOutcome> {
        debug!(key = %key, "syncing pvc");

        let (namespace, name) = match split_meta_namespace_key(key) {
            Ok(parts) => parts,
            Err(e) => {
                error!(key = %key, error = %e, "error getting namespace & name of pvc");
                return Ok(SyncOutcome::Dropped);
            }
        };

        let claim = match self.claims.get_claim(namespace.unwrap_or_default(), name) {
            Ok(claim) => claim,
            Err(Error::NotFound { .. }) => {
                info!(key = %key, "pvc in work queue no longer exists");
                return Ok(SyncOutcome::Dropped);
            }
            Err(e) => {
                debug!(key = %key, error = %e, "error getting pvc from cache");
                return Err(e);
            }
        };

        let verdict =
            data_source::validate_claim(&claim, self.populators.as_ref(), self.metrics.as_ref())?;

        if !verdict.valid {
            self.recorder.warning(
                claim.object_ref(&()),
                UNRECOGNIZED_DATA_SOURCE_REASON,
                UNRECOGNIZED_DATA_SOURCE_MESSAGE,
            );
        }

        Ok(SyncOutcome::Succeeded(verdict.result))
    }
}
