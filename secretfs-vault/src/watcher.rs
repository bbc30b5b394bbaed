//! Lease watchers.
//!
//! One background task per renewable lease. A watcher sleeps until the lease
//! is due, requests renewal, reports each success through `on_renewed`, and
//! calls `on_done` exactly once on termination — natural expiry, renewal
//! failure, or cancellation. Watchers live in a [`WatcherSet`] owned by their
//! session; a terminating watcher removes its own entry before firing
//! `on_done`, so `stop` on an already-terminating watcher never joins it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use secretfs_core::SecretError;

use crate::api::RenewalInfo;

/// Renewal operation supplied by the session: captures the HTTP client, the
/// token and the lease id, so the watcher holds no owning session reference.
pub type RenewFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<RenewalInfo, SecretError>> + Send>>
        + Send
        + Sync,
>;

/// Fired once on termination; `None` means expiry or cancellation.
pub type OnDone = Arc<dyn Fn(Option<SecretError>) + Send + Sync>;

/// Fired after each successful renewal.
pub type OnRenewed = Arc<dyn Fn(&RenewalInfo) + Send + Sync>;

struct WatcherEntry {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The set of live watchers belonging to one session.
#[derive(Default)]
pub struct WatcherSet {
    inner: Arc<Mutex<HashMap<Uuid, WatcherEntry>>>,
}

impl WatcherSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a watcher for a lease currently valid for `lease_duration`
    /// seconds, renewing with the given increment.
    pub fn spawn(
        &self,
        lease_duration: u64,
        renew: RenewFn,
        on_renewed: Option<OnRenewed>,
        on_done: OnDone,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let map = Arc::downgrade(&self.inner);
        let task = tokio::spawn(run_watcher(
            id,
            cancel_rx,
            lease_duration,
            renew,
            on_renewed,
            on_done,
            map,
        ));

        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, WatcherEntry { cancel: cancel_tx, task });

        debug!(watcher = %id, lease_duration, "lease watcher started");
        id
    }

    /// Cancel one watcher and wait for it to terminate (its `on_done` has run
    /// by the time this returns). Returns `false` if no such watcher exists —
    /// including one that terminated on its own.
    pub async fn stop(&self, id: Uuid) -> bool {
        let entry = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        let Some(entry) = entry else {
            return false;
        };
        let _ = entry.cancel.send(());
        let _ = entry.task.await;
        true
    }

    /// Cancel every watcher and wait for all of them.
    pub async fn stop_all(&self) {
        let entries: Vec<WatcherEntry> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, v)| v)
            .collect();
        for entry in entries {
            let _ = entry.cancel.send(());
            let _ = entry.task.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sleep for two thirds of the lease before renewing, clamped to at least a
/// second so a short lease cannot spin.
fn renew_delay(lease_duration: u64) -> Duration {
    Duration::from_secs((lease_duration * 2 / 3).max(1))
}

async fn run_watcher(
    id: Uuid,
    mut cancel: oneshot::Receiver<()>,
    initial_duration: u64,
    renew: RenewFn,
    on_renewed: Option<OnRenewed>,
    on_done: OnDone,
    map: Weak<Mutex<HashMap<Uuid, WatcherEntry>>>,
) {
    let mut delay = renew_delay(initial_duration);

    let outcome: Option<SecretError> = loop {
        tokio::select! {
            _ = &mut cancel => {
                trace!(watcher = %id, "lease watcher cancelled");
                break None;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match renew().await {
            Ok(info) => {
                trace!(watcher = %id, lease_duration = info.lease_duration, "lease renewed");
                if let Some(cb) = &on_renewed {
                    cb(&info);
                }
                if !info.renewable || info.lease_duration == 0 {
                    debug!(watcher = %id, "lease no longer renewable, watcher done");
                    break None;
                }
                delay = renew_delay(info.lease_duration);
            }
            Err(e) => break Some(e),
        }
    };

    // Drop our own entry first: a concurrent `stop` must not try to join a
    // task that is about to run callbacks which may reach back into the owner.
    if let Some(map) = map.upgrade() {
        map.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }

    on_done(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_renew(
        calls: Arc<AtomicUsize>,
        results: Arc<Mutex<Vec<Result<RenewalInfo, SecretError>>>>,
    ) -> RenewFn {
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let next = results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(RenewalInfo { lease_duration: 30, renewable: true }));
            Box::pin(async move { next })
        })
    }

    fn done_recorder() -> (OnDone, Arc<Mutex<Vec<Option<String>>>>) {
        let record: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&record);
        let on_done: OnDone = Arc::new(move |err| {
            r.lock().unwrap().push(err.map(|e| e.to_string()));
        });
        (on_done, record)
    }

    #[tokio::test(start_paused = true)]
    async fn renews_until_cancelled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(Mutex::new(Vec::new()));
        let (on_done, record) = done_recorder();

        let set = WatcherSet::new();
        let id = set.spawn(
            30,
            counting_renew(Arc::clone(&calls), results),
            None,
            on_done,
        );

        // 30s lease renews every 20s; after 65 paused-clock seconds we expect
        // three renewals.
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert!(set.stop(id).await);
        assert_eq!(record.lock().unwrap().as_slice(), &[None]);
        assert!(set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reports_error_and_self_removes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(Mutex::new(vec![Err(SecretError::Unauthorized(
            "403: permission denied".to_string(),
        ))]));
        let (on_done, record) = done_recorder();

        let set = WatcherSet::new();
        let id = set.spawn(30, counting_renew(calls, results), None, on_done);

        tokio::time::sleep(Duration::from_secs(25)).await;

        let record = record.lock().unwrap();
        assert_eq!(record.len(), 1);
        assert!(record[0].as_deref().unwrap().contains("permission denied"));
        drop(record);

        // Entry is gone; stopping again is a no-op.
        assert!(set.is_empty());
        assert!(!set.stop(id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_terminates_without_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(Mutex::new(vec![Ok(RenewalInfo {
            lease_duration: 0,
            renewable: false,
        })]));
        let (on_done, record) = done_recorder();

        let set = WatcherSet::new();
        set.spawn(30, counting_renew(Arc::clone(&calls), results), None, on_done);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(record.lock().unwrap().as_slice(), &[None]);
        assert!(set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn on_renewed_sees_each_renewal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let renewed = Arc::new(AtomicUsize::new(0));
        let renewed_cb = Arc::clone(&renewed);
        let on_renewed: OnRenewed = Arc::new(move |info| {
            assert_eq!(info.lease_duration, 30);
            renewed_cb.fetch_add(1, Ordering::SeqCst);
        });
        let (on_done, _) = done_recorder();

        let set = WatcherSet::new();
        let id = set.spawn(
            30,
            counting_renew(calls, Arc::new(Mutex::new(Vec::new()))),
            Some(on_renewed),
            on_done,
        );

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(renewed.load(Ordering::SeqCst), 2);
        set.stop(id).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_joins_every_watcher() {
        let (on_done, record) = done_recorder();
        let set = WatcherSet::new();
        for _ in 0..3 {
            set.spawn(
                3600,
                counting_renew(Arc::new(AtomicUsize::new(0)), Arc::new(Mutex::new(Vec::new()))),
                None,
                Arc::clone(&on_done),
            );
        }
        assert_eq!(set.len(), 3);

        set.stop_all().await;
        assert!(set.is_empty());
        assert_eq!(record.lock().unwrap().len(), 3);
    }
}
