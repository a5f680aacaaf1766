//! Best-effort Kubernetes event recording
//!
//! Workers hand events to an [`EventRecorder`] without blocking. The
//! Kubernetes implementation forwards them over a channel to a background
//! broadcaster task that logs each one and publishes it as a core/v1 `Event`.
//! Repeats of the same event on the same object are folded into one `Event`
//! whose `count` and `lastTimestamp` are bumped instead of creating a new
//! object. Publish failures are logged and dropped.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Component name reported on every event
pub const COMPONENT: &str = "volume-data-source-validator";

/// Number of event series remembered for aggregation
pub const MAX_SERIES: usize = 4096;

/// Severity of an event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

/// An event waiting to be published
#[derive(Clone, Debug, PartialEq)]
pub struct PendingEvent {
    pub reference: ObjectReference,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Attaches human-facing events to objects
pub trait EventRecorder: Send + Sync {
    /// Record an event about `reference`. Must not block.
    fn record(&self, event: PendingEvent);

    fn warning(&self, reference: ObjectReference, reason: &str, message: &str) {
        self.record(PendingEvent {
            reference,
            event_type: EventType::Warning,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Recorder that forwards events to the broadcaster task
#[derive(Clone)]
pub struct KubeEventRecorder {
    tx: mpsc::UnboundedSender<PendingEvent>,
}

impl KubeEventRecorder {
    /// Create a recorder and the receiving end of its queue
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PendingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Create a recorder whose events are published through `client`
    /// until `cancel` fires.
    pub fn start(client: Client, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (recorder, rx) = Self::channel();
        let handle = tokio::spawn(broadcast(client, rx, cancel));
        (recorder, handle)
    }
}

impl EventRecorder for KubeEventRecorder {
    fn record(&self, event: PendingEvent) {
        if self.tx.send(event).is_err() {
            debug!("event broadcaster stopped, dropping event");
        }
    }
}

async fn broadcast(
    client: Client,
    mut rx: mpsc::UnboundedReceiver<PendingEvent>,
    cancel: CancellationToken,
) {
    let mut correlator = EventCorrelator::default();
    loop {
        let pending = tokio::select! {
            _ = cancel.cancelled() => break,
            pending = rx.recv() => match pending {
                Some(pending) => pending,
                None => break,
            },
        };

        info!(
            object = %describe(&pending.reference),
            event_type = %pending.event_type,
            reason = %pending.reason,
            message = %pending.message,
            "Event occurred"
        );

        let namespace = pending
            .reference
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let api: Api<Event> = Api::namespaced(client.clone(), &namespace);
        if let Err(e) = publish(&api, &mut correlator, &pending).await {
            correlator.forget(&pending);
            warn!(error = %e, object = %describe(&pending.reference), "Failed to publish event");
        }
    }
}

async fn publish(
    api: &Api<Event>,
    correlator: &mut EventCorrelator,
    pending: &PendingEvent,
) -> kube::Result<()> {
    let event = match correlator.observe(pending.clone(), Utc::now()) {
        Publish::Create(event) => event,
        Publish::Update(event) => {
            let name = event.metadata.name.clone().unwrap_or_default();
            let patch = json!({
                "count": event.count,
                "lastTimestamp": event.last_timestamp,
                "message": event.message,
            });
            match api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)).await {
                Ok(_) => return Ok(()),
                // The aggregated Event expired; start a new series.
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    debug!(event = %name, "aggregated event gone, recreating");
                    correlator.forget(pending);
                    correlator.observe(pending.clone(), Utc::now()).into_event()
                }
                Err(e) => return Err(e),
            }
        }
    };
    api.create(&PostParams::default(), &event).await?;
    Ok(())
}

/// How an observed event reaches the API server
#[derive(Clone, Debug, PartialEq)]
pub enum Publish {
    /// First occurrence in its series: create this Event
    Create(Event),
    /// Repeat: patch `count` and `lastTimestamp` of the existing Event
    Update(Event),
}

impl Publish {
    pub fn event(&self) -> &Event {
        match self {
            Publish::Create(event) | Publish::Update(event) => event,
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            Publish::Create(event) | Publish::Update(event) => event,
        }
    }
}

/// Identity of an event series: same object, type, reason and message
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SeriesKey {
    object: String,
    uid: Option<String>,
    event_type: EventType,
    reason: String,
    message: String,
}

impl SeriesKey {
    fn new(pending: &PendingEvent) -> Self {
        Self {
            object: describe(&pending.reference),
            uid: pending.reference.uid.clone(),
            event_type: pending.event_type,
            reason: pending.reason.clone(),
            message: pending.message.clone(),
        }
    }
}

#[derive(Clone, Debug)]
struct Series {
    name: String,
    count: i32,
    first_timestamp: DateTime<Utc>,
    last_timestamp: DateTime<Utc>,
}

/// Folds repeated events into one `Event` per series.
///
/// Remembers at most `capacity` series; the least recently seen one is
/// evicted first, and its next occurrence starts a new `Event`.
pub struct EventCorrelator {
    series: HashMap<SeriesKey, Series>,
    capacity: usize,
}

impl Default for EventCorrelator {
    fn default() -> Self {
        Self::new(MAX_SERIES)
    }
}

impl EventCorrelator {
    pub fn new(capacity: usize) -> Self {
        Self {
            series: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Account for `pending` occurring at `now`.
    pub fn observe(&mut self, pending: PendingEvent, now: DateTime<Utc>) -> Publish {
        let key = SeriesKey::new(&pending);
        if let Some(series) = self.series.get_mut(&key) {
            series.count += 1;
            series.last_timestamp = now;
            return Publish::Update(build_event(pending, series));
        }

        if self.series.len() >= self.capacity {
            self.evict_oldest();
        }
        let series = Series {
            name: event_name(&pending.reference, now),
            count: 1,
            first_timestamp: now,
            last_timestamp: now,
        };
        let event = build_event(pending, &series);
        self.series.insert(key, series);
        Publish::Create(event)
    }

    /// Drop the series of `pending` so its next occurrence creates a new Event.
    pub fn forget(&mut self, pending: &PendingEvent) {
        self.series.remove(&SeriesKey::new(pending));
    }

    /// Number of series currently remembered
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .series
            .iter()
            .min_by_key(|(_, series)| series.last_timestamp)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.series.remove(&key);
        }
    }
}

/// `<object>.<hex nanos>`, unique per series
fn event_name(reference: &ObjectReference, now: DateTime<Utc>) -> String {
    format!(
        "{}.{:x}",
        reference.name.as_deref().unwrap_or_default(),
        now.timestamp_nanos_opt().unwrap_or_default()
    )
}

fn build_event(pending: PendingEvent, series: &Series) -> Event {
    Event {
        metadata: ObjectMeta {
            name: Some(series.name.clone()),
            namespace: pending.reference.namespace.clone(),
            ..Default::default()
        },
        involved_object: pending.reference,
        type_: Some(pending.event_type.to_string()),
        reason: Some(pending.reason),
        message: Some(pending.message),
        source: Some(EventSource {
            component: Some(COMPONENT.to_string()),
            host: None,
        }),
        reporting_component: Some(COMPONENT.to_string()),
        first_timestamp: Some(Time(series.first_timestamp)),
        last_timestamp: Some(Time(series.last_timestamp)),
        count: Some(series.count),
        ..Default::default()
    }
}

fn describe(reference: &ObjectReference) -> String {
    format!(
        "{}/{}/{}",
        reference.kind.as_deref().unwrap_or_default(),
        reference.namespace.as_deref().unwrap_or_default(),
        reference.name.as_deref().unwrap_or_default()
    )
}
