//! Kubernetes controller for PVC data sources
//!
//! Wires the caches, their watches, the event broadcaster and the worker
//! pool together.

mod data_source_controller;

pub use data_source_controller::{
    DataSourceValidator, SyncOutcome, UNRECOGNIZED_DATA_SOURCE_MESSAGE,
    UNRECOGNIZED_DATA_SOURCE_REASON,
};

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::DynamicObject;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{informer, ChangeEvent, Store};
use crate::config::Config;
use crate::crd::{populator_resource, POPULATOR_KIND};
use crate::error::Result;
use crate::events::KubeEventRecorder;
use crate::metrics::MetricsRecorder;

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,

    /// Validated process configuration
    pub config: Config,

    /// Validation outcome metrics
    pub metrics: Arc<dyn MetricsRecorder>,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, config: Config, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            client,
            config,
            metrics,
        }
    }
}

/// Run the data source controller until `cancel` fires.
///
/// Fails if the caches cannot be synced.
pub async fn run(context: Arc<Context>, cancel: CancellationToken) -> Result<()> {
    let claims: Arc<Store<PersistentVolumeClaim>> = Arc::new(Store::new("PersistentVolumeClaim"));
    let populators: Arc<Store<DynamicObject>> = Arc::new(Store::new(POPULATOR_KIND));

    let (recorder, broadcaster) = KubeEventRecorder::start(context.client.clone(), cancel.clone());
    let validator = Arc::new(DataSourceValidator::new(
        claims.clone(),
        populators.clone(),
        Arc::new(recorder),
        context.metrics.clone(),
    ));

    let weak = Arc::downgrade(&validator);
    claims.subscribe(move |event: &ChangeEvent<PersistentVolumeClaim>| {
        if let Some(validator) = weak.upgrade() {
            validator.enqueue_work(event);
        }
    });

    let claim_api: Api<PersistentVolumeClaim> = Api::all(context.client.clone());
    let populator_api: Api<DynamicObject> =
        Api::all_with(context.client.clone(), &populator_resource());

    info!(
        resync_period = ?context.config.resync_period,
        workers = context.config.worker_threads,
        "Starting informers"
    );
    let claim_informer = tokio::spawn(informer::run(
        claim_api,
        claims.clone(),
        context.config.resync_period,
        cancel.clone(),
    ));
    // Nothing subscribes to populator changes, so there is nothing to resync.
    let populator_informer = tokio::spawn(informer::run(
        populator_api,
        populators.clone(),
        Duration::ZERO,
        cancel.clone(),
    ));

    let result = validator
        .run(
            context.config.worker_threads,
            vec![populators.sync_handle(), claims.sync_handle()],
            cancel.clone(),
        )
        .await;

    cancel.cancel();
    for (task, handle) in [
        ("pvc informer", claim_informer),
        ("populator informer", populator_informer),
        ("event broadcaster", broadcaster),
    ] {
        if let Err(e) = handle.await {
            warn!(task, error = %e, "background task failed");
        }
    }

    result
}
