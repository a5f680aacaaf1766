//! In-memory object store for one resource kind

use std::collections::HashMap;
use std::sync::Arc;

use kube::Resource;
use kube_runtime::watcher;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::debug;

use super::{ChangeEvent, DeletedObject, ObjectKey};

/// Callback invoked for every change applied to a [`Store`]
pub type ChangeHandler<K> = Box<dyn Fn(&ChangeEvent<K>) + Send + Sync>;

/// Latest known state of every object of one kind.
///
/// Each change swaps a single `Arc` under the write lock. Subscribed
/// handlers run after the lock is released.
pub struct Store<K> {
    kind: &'static str,
    objects: RwLock<HashMap<ObjectKey, Arc<K>>>,
    relist: Mutex<Option<HashMap<ObjectKey, Arc<K>>>>,
    handlers: RwLock<Vec<ChangeHandler<K>>>,
    synced: watch::Sender<bool>,
}

impl<K: Resource> Store<K> {
    /// Create an empty, unsynced store
    pub fn new(kind: &'static str) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            kind,
            objects: RwLock::new(HashMap::new()),
            relist: Mutex::new(None),
            handlers: RwLock::new(Vec::new()),
            synced,
        }
    }

    /// Resource kind held by this store
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Get an object by key
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.objects.read().get(key).cloned()
    }

    /// Snapshot of every cached object, in no particular order
    pub fn list(&self) -> Vec<Arc<K>> {
        self.objects.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Register a handler for subsequent changes
    pub fn subscribe(&self, handler: impl Fn(&ChangeEvent<K>) + Send + Sync + 'static) {
        self.handlers.write().push(Box::new(handler));
    }

    /// Whether the initial listing has been applied
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Receiver that flips to `true` once the initial listing is applied
    pub fn sync_handle(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Apply one event from the watch stream
    pub fn apply_watch_event(&self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Init => {
                debug!(kind = self.kind, "relist started");
                *self.relist.lock() = Some(HashMap::new());
            }
            watcher::Event::InitApply(obj) => {
                let key = ObjectKey::from_resource(&obj);
                self.relist
                    .lock()
                    .get_or_insert_with(HashMap::new)
                    .insert(key, Arc::new(obj));
            }
            watcher::Event::InitDone => {
                let fresh = self.relist.lock().take().unwrap_or_default();
                debug!(kind = self.kind, count = fresh.len(), "relist complete");
                self.swap(fresh);
            }
            watcher::Event::Apply(obj) => self.upsert(obj),
            watcher::Event::Delete(obj) => self.delete(obj),
        }
    }

    /// Insert or update a single object
    pub fn upsert(&self, obj: K) {
        let key = ObjectKey::from_resource(&obj);
        let new = Arc::new(obj);
        let old = self.objects.write().insert(key, new.clone());

        let event = match old {
            Some(old) => ChangeEvent::Updated { old, new },
            None => ChangeEvent::Added(new),
        };
        self.notify(&[event]);
    }

    /// Remove a single object, using its final observed state
    pub fn delete(&self, obj: K) {
        let key = ObjectKey::from_resource(&obj);
        self.objects.write().remove(&key);
        self.notify(&[ChangeEvent::Deleted(DeletedObject::Final(Arc::new(obj)))]);
    }

    /// Replace the full contents with a fresh listing and mark the store
    /// synced.
    pub fn replace(&self, objects: Vec<K>) {
        let fresh = objects
            .into_iter()
            .map(|obj| (ObjectKey::from_resource(&obj), Arc::new(obj)))
            .collect();
        self.swap(fresh);
    }

    /// Re-deliver every cached object as an update
    pub fn resync(&self) {
        let events: Vec<_> = self
            .list()
            .into_iter()
            .map(|obj| ChangeEvent::Updated {
                old: obj.clone(),
                new: obj,
            })
            .collect();
        debug!(kind = self.kind, count = events.len(), "resync");
        self.notify(&events);
    }

    fn swap(&self, fresh: HashMap<ObjectKey, Arc<K>>) {
        let mut events = Vec::with_capacity(fresh.len());
        {
            let mut objects = self.objects.write();
            for (key, new) in &fresh {
                match objects.get(key) {
                    Some(old) => events.push(ChangeEvent::Updated {
                        old: old.clone(),
                        new: new.clone(),
                    }),
                    None => events.push(ChangeEvent::Added(new.clone())),
                }
            }
            // Deleted while the watch was down; only the key is left.
            for key in objects.keys() {
                if !fresh.contains_key(key) {
                    events.push(ChangeEvent::Deleted(DeletedObject::Tombstone(key.clone())));
                }
            }
            *objects = fresh;
        }

        self.synced.send_replace(true);
        self.notify(&events);
    }

    fn notify(&self, events: &[ChangeEvent<K>]) {
        let handlers = self.handlers.read();
        for event in events {
            for handler in handlers.iter() {
                handler(event);
            }
        }
    }
}
