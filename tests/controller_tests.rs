//! Integration tests for the data source controller
//!
//! These tests drive the reconciliation loop against in-memory caches and
//! fake event and metrics sinks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedObjectReference,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use volume_data_source_validator::cache::{
    ChangeEvent, ClaimLister, DeletedObject, ObjectKey, PopulatorLister, Store,
};
use volume_data_source_validator::controllers::{
    DataSourceValidator, SyncOutcome, UNRECOGNIZED_DATA_SOURCE_MESSAGE,
    UNRECOGNIZED_DATA_SOURCE_REASON,
};
use volume_data_source_validator::crd::{populator_resource, POPULATOR_KIND};
use volume_data_source_validator::events::{
    EventCorrelator, EventRecorder, EventType, PendingEvent, Publish,
};
use volume_data_source_validator::metrics::{DataSourceResult, OperationMetrics};
use volume_data_source_validator::queue::{ItemExponentialRateLimiter, WorkQueue};
use volume_data_source_validator::{Error, Result};

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Default)]
struct FakeRecorder {
    events: Mutex<Vec<PendingEvent>>,
}

impl EventRecorder for FakeRecorder {
    fn record(&self, event: PendingEvent) {
        self.events.lock().push(event);
    }
}

struct BrokenPopulatorLister;

impl PopulatorLister for BrokenPopulatorLister {
    fn list_populators(&self) -> Result<Vec<Arc<DynamicObject>>> {
        Err(Error::catalog_unavailable("failed"))
    }
}

struct BrokenClaimLister;

impl ClaimLister for BrokenClaimLister {
    fn get_claim(&self, _namespace: &str, _name: &str) -> Result<Arc<PersistentVolumeClaim>> {
        Err(Error::lookup("cache unavailable"))
    }
}

struct Harness {
    claims: Arc<Store<PersistentVolumeClaim>>,
    populators: Arc<Store<DynamicObject>>,
    recorder: Arc<FakeRecorder>,
    metrics: Arc<OperationMetrics>,
    validator: Arc<DataSourceValidator>,
}

impl Harness {
    fn new() -> Self {
        let claims = Arc::new(Store::new("PersistentVolumeClaim"));
        let populators = Arc::new(Store::new(POPULATOR_KIND));
        populators.replace(vec![populator("valid", "valid.example.io", "Valid")]);
        Self::with_listers(claims, populators.clone(), populators)
    }

    fn with_listers(
        claims: Arc<Store<PersistentVolumeClaim>>,
        populators: Arc<Store<DynamicObject>>,
        lister: Arc<dyn PopulatorLister>,
    ) -> Self {
        let recorder = Arc::new(FakeRecorder::default());
        let metrics = Arc::new(OperationMetrics::new().unwrap());
        let validator = Arc::new(DataSourceValidator::new(
            claims.clone(),
            lister,
            recorder.clone(),
            metrics.clone(),
        ));
        Self {
            claims,
            populators,
            recorder,
            metrics,
            validator,
        }
    }

    fn events(&self) -> Vec<PendingEvent> {
        self.recorder.events.lock().clone()
    }
}

fn populator(name: &str, group: &str, kind: &str) -> DynamicObject {
    DynamicObject::new(name, &populator_resource())
        .data(json!({"sourceKind": {"group": group, "kind": kind}}))
}

fn claim(name: &str, data_source: Option<(&str, &str)>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            data_source_ref: data_source.map(|(group, kind)| TypedObjectReference {
                api_group: Some(group.to_string()),
                kind: kind.to_string(),
                name: "source".to_string(),
                namespace: None,
            }),
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Sync outcomes
// ============================================================================

#[test]
fn claim_without_data_source_succeeds_silently() {
    let h = Harness::new();
    h.claims.upsert(claim("plain", None));

    let outcome = h.validator.sync_claim_by_key("default/plain").unwrap();

    assert_eq!(outcome, SyncOutcome::Succeeded(DataSourceResult::Empty));
    assert_eq!(h.metrics.count(DataSourceResult::Empty), 1);
    assert!(h.events().is_empty());
}

#[test]
fn clone_and_snapshot_sources_succeed_silently() {
    let h = Harness::new();
    h.claims.upsert(claim("clone", Some(("", "PersistentVolumeClaim"))));
    h.claims
        .upsert(claim("restore", Some(("snapshot.storage.k8s.io", "VolumeSnapshot"))));

    assert_eq!(
        h.validator.sync_claim_by_key("default/clone").unwrap(),
        SyncOutcome::Succeeded(DataSourceResult::Pvc)
    );
    assert_eq!(
        h.validator.sync_claim_by_key("default/restore").unwrap(),
        SyncOutcome::Succeeded(DataSourceResult::Snapshot)
    );
    assert!(h.events().is_empty());
}

#[test]
fn registered_populator_succeeds_silently() {
    let h = Harness::new();
    h.claims.upsert(claim("populated", Some(("valid.example.io", "Valid"))));

    let outcome = h.validator.sync_claim_by_key("default/populated").unwrap();

    assert_eq!(outcome, SyncOutcome::Succeeded(DataSourceResult::Populator));
    assert!(h.events().is_empty());
}

#[test]
fn unrecognized_data_source_emits_warning() {
    let h = Harness::new();
    h.claims.upsert(claim("unknown", Some(("invalid.example.io", "Invalid"))));

    let outcome = h.validator.sync_claim_by_key("default/unknown").unwrap();

    assert_eq!(outcome, SyncOutcome::Succeeded(DataSourceResult::Invalid));
    assert_eq!(h.metrics.count(DataSourceResult::Invalid), 1);

    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Warning);
    assert_eq!(events[0].reason, UNRECOGNIZED_DATA_SOURCE_REASON);
    assert_eq!(events[0].message, UNRECOGNIZED_DATA_SOURCE_MESSAGE);
    assert_eq!(events[0].reference.kind.as_deref(), Some("PersistentVolumeClaim"));
    assert_eq!(events[0].reference.name.as_deref(), Some("unknown"));
    assert_eq!(events[0].reference.namespace.as_deref(), Some("default"));
}

#[test]
fn populator_installed_later_clears_warning() {
    let h = Harness::new();
    h.claims.upsert(claim("later", Some(("later.example.io", "Later"))));

    h.validator.sync_claim_by_key("default/later").unwrap();
    assert_eq!(h.events().len(), 1);

    h.populators.upsert(populator("later", "later.example.io", "Later"));
    let outcome = h.validator.sync_claim_by_key("default/later").unwrap();

    assert_eq!(outcome, SyncOutcome::Succeeded(DataSourceResult::Populator));
    assert_eq!(h.events().len(), 1);
}

#[test]
fn deleted_claim_is_dropped() {
    let h = Harness::new();

    let outcome = h.validator.sync_claim_by_key("default/gone").unwrap();

    assert_eq!(outcome, SyncOutcome::Dropped);
    assert!(h.events().is_empty());
}

#[test]
fn malformed_key_is_dropped() {
    let h = Harness::new();
    assert_eq!(
        h.validator.sync_claim_by_key("a/b/c").unwrap(),
        SyncOutcome::Dropped
    );
}

#[test]
fn catalog_failure_is_retryable_and_emits_no_event() {
    let claims = Arc::new(Store::new("PersistentVolumeClaim"));
    let h = Harness::with_listers(
        claims,
        Arc::new(Store::new(POPULATOR_KIND)),
        Arc::new(BrokenPopulatorLister),
    );
    h.claims.upsert(claim("data", Some(("valid.example.io", "Valid"))));

    let err = h.validator.sync_claim_by_key("default/data").unwrap_err();

    assert_eq!(err.to_string(), "failed");
    assert!(err.is_retryable());
    assert_eq!(h.metrics.count(DataSourceResult::Error), 1);
    assert!(h.events().is_empty());
}

#[test]
fn claim_lookup_failure_is_retryable() {
    let populators: Arc<Store<DynamicObject>> = Arc::new(Store::new(POPULATOR_KIND));
    let validator = DataSourceValidator::new(
        Arc::new(BrokenClaimLister),
        populators,
        Arc::new(FakeRecorder::default()),
        Arc::new(OperationMetrics::new().unwrap()),
    );

    let err = validator.sync_claim_by_key("default/data").unwrap_err();
    assert!(matches!(err, Error::LookupFailure(_)));
    assert!(err.is_retryable());
}

// ============================================================================
// Queue handling
// ============================================================================

#[tokio::test]
async fn change_events_enqueue_claim_keys() {
    let h = Harness::new();
    let pvc = Arc::new(claim("data", None));

    h.validator.enqueue_work(&ChangeEvent::Added(pvc.clone()));
    h.validator.enqueue_work(&ChangeEvent::Updated {
        old: pvc.clone(),
        new: pvc.clone(),
    });
    h.validator
        .enqueue_work(&ChangeEvent::Deleted(DeletedObject::Tombstone(ObjectKey::new(
            Some("default"),
            "data",
        ))));

    assert_eq!(h.validator.queue().len(), 1);
    assert_eq!(h.validator.queue().get().await.as_deref(), Some("default/data"));
}

#[tokio::test]
async fn successful_sync_forgets_backoff() {
    let h = Harness::new();
    h.claims.upsert(claim("data", None));
    let queue = h.validator.queue();

    queue.add_rate_limited("default/data");
    assert_eq!(queue.num_requeues("default/data"), 1);
    queue.add("default/data");

    assert!(h.validator.process_next_item().await);
    assert_eq!(queue.num_requeues("default/data"), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_sync_is_requeued_with_backoff() {
    let claims = Arc::new(Store::new("PersistentVolumeClaim"));
    let recorder = Arc::new(FakeRecorder::default());
    let metrics = Arc::new(OperationMetrics::new().unwrap());
    let queue = WorkQueue::with_rate_limiter(
        "pvc",
        ItemExponentialRateLimiter::new(Duration::from_secs(1), Duration::from_secs(4)),
    );
    let validator = DataSourceValidator::with_queue(
        claims.clone(),
        Arc::new(BrokenPopulatorLister),
        recorder,
        metrics.clone(),
        queue.clone(),
    );
    claims.upsert(claim("data", Some(("valid.example.io", "Valid"))));

    queue.add("default/data");
    assert!(validator.process_next_item().await);

    assert!(queue.is_empty());
    assert_eq!(queue.num_requeues("default/data"), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(queue.len(), 1);

    // Retries continue past the backoff ceiling
    for _ in 0..5 {
        assert!(validator.process_next_item().await);
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    assert_eq!(queue.num_requeues("default/data"), 6);
    assert_eq!(metrics.count(DataSourceResult::Error), 6);
}

#[tokio::test]
async fn deleted_claim_is_not_retried() {
    let h = Harness::new();
    let queue = h.validator.queue();

    queue.add("default/gone");
    assert!(h.validator.process_next_item().await);

    assert!(queue.is_empty());
    assert_eq!(queue.num_requeues("default/gone"), 0);
}

#[tokio::test]
async fn repeated_enqueues_are_processed_once() {
    let h = Harness::new();
    let pvc = Arc::new(claim("unknown", Some(("invalid.example.io", "Invalid"))));
    h.claims.upsert((*pvc).clone());

    for _ in 0..10 {
        h.validator.enqueue_work(&ChangeEvent::Added(pvc.clone()));
    }
    assert!(h.validator.process_next_item().await);

    assert!(h.validator.queue().is_empty());
    assert_eq!(h.events().len(), 1);
}

#[tokio::test]
async fn resynced_invalid_claim_aggregates_into_one_event() {
    let h = Harness::new();
    let weak = Arc::downgrade(&h.validator);
    h.claims.subscribe(move |event: &ChangeEvent<PersistentVolumeClaim>| {
        if let Some(validator) = weak.upgrade() {
            validator.enqueue_work(event);
        }
    });

    h.claims
        .replace(vec![claim("unknown", Some(("invalid.example.io", "Invalid")))]);
    assert!(h.validator.process_next_item().await);
    h.claims.resync();
    assert!(h.validator.process_next_item().await);

    let events = h.events();
    assert_eq!(events.len(), 2);

    let mut correlator = EventCorrelator::default();
    let published: Vec<Publish> = events
        .into_iter()
        .map(|pending| correlator.observe(pending, Utc::now()))
        .collect();

    assert!(matches!(published[0], Publish::Create(_)));
    let Publish::Update(event) = &published[1] else {
        panic!("repeated warning must update the existing event");
    };
    assert_eq!(event.metadata.name, published[0].event().metadata.name);
    assert_eq!(event.count, Some(2));
    assert_eq!(correlator.len(), 1);
}

#[tokio::test]
async fn process_next_item_stops_after_shutdown() {
    let h = Harness::new();
    h.validator.queue().shut_down();
    assert!(!h.validator.process_next_item().await);
}

// ============================================================================
// Run loop
// ============================================================================

#[tokio::test]
async fn run_processes_changes_after_sync_and_stops_on_cancel() {
    let h = Harness::new();
    let weak = Arc::downgrade(&h.validator);
    h.claims.subscribe(move |event: &ChangeEvent<PersistentVolumeClaim>| {
        if let Some(validator) = weak.upgrade() {
            validator.enqueue_work(event);
        }
    });

    let cancel = CancellationToken::new();
    let run = tokio::spawn(h.validator.clone().run(
        2,
        vec![h.populators.sync_handle(), h.claims.sync_handle()],
        cancel.clone(),
    ));

    h.claims
        .replace(vec![claim("unknown", Some(("invalid.example.io", "Invalid")))]);

    for _ in 0..100 {
        if !h.events().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.events().len(), 1);

    cancel.cancel();
    run.await.unwrap().unwrap();
    assert!(h.validator.queue().is_shutting_down());
}

#[tokio::test]
async fn run_returns_when_cancelled_before_sync() {
    let h = Harness::new();
    let unsynced: Store<PersistentVolumeClaim> = Store::new("PersistentVolumeClaim");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h
        .validator
        .clone()
        .run(1, vec![unsynced.sync_handle()], cancel)
        .await;

    assert!(result.is_ok());
    assert!(h.validator.queue().is_shutting_down());
}

#[tokio::test]
async fn run_fails_when_cache_can_never_sync() {
    let h = Harness::new();
    let unsynced: Store<PersistentVolumeClaim> = Store::new("PersistentVolumeClaim");
    let handle = unsynced.sync_handle();
    drop(unsynced);

    let result = h
        .validator
        .clone()
        .run(1, vec![handle], CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::CacheSync)));
}
