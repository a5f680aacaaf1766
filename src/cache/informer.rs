//! Feeds a [`Store`] from a Kubernetes watch
//!
//! Handles list+watch, relists after watch desync, and periodic resync.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{Api, Resource};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Store;

/// Run list+watch for `api` into `store` until `cancel` fires.
///
/// A zero `resync_period` disables periodic resync.
pub async fn run<K>(
    api: Api<K>,
    store: Arc<Store<K>>,
    resync_period: Duration,
    cancel: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);

    let mut resync = resync_interval(resync_period);
    info!(kind = store.kind(), "watcher started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick(&mut resync) => {
                if store.has_synced() {
                    store.resync();
                }
            }
            event = stream.next() => match event {
                Some(Ok(event)) => store.apply_watch_event(event),
                Some(Err(e)) => {
                    warn!(kind = store.kind(), error = %e, "watch failed, retrying");
                }
                None => {
                    warn!(kind = store.kind(), "watcher stream ended");
                    break;
                }
            },
        }
    }

    info!(kind = store.kind(), "watcher stopped");
}

fn resync_interval(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
