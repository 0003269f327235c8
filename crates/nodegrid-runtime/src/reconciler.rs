//! Reconciler trait and the bounded worker pool that drives it.

use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ControllerResult, Requeue};
use crate::queue::WorkQueue;

/// What to do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing left to do until the next event.
    Done,
    /// Check again after the delay.
    Requeue(Duration),
}

/// A controller's per-key reconcile function.
///
/// Implementations must be safe to re-run after partial progress: every
/// call recomputes from the registry rather than trusting earlier results.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Display + Send + Sync + 'static;

    /// Controller name for logs.
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &Self::Key) -> ControllerResult<Action>;

    /// Every key that should be re-checked on a periodic resync.
    fn resync_keys(&self) -> ControllerResult<Vec<Self::Key>> {
        Ok(Vec::new())
    }
}

/// Enqueue every resync key on a fixed interval until shutdown.
pub fn spawn_resync<R: Reconciler>(
    reconciler: Arc<R>,
    queue: WorkQueue<R::Key>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match reconciler.resync_keys() {
                        Ok(keys) => {
                            debug!(controller = reconciler.name(), keys = keys.len(), "resync");
                            for key in keys {
                                queue.add(key);
                            }
                        }
                        Err(e) => warn!(controller = reconciler.name(), error = %e, "resync listing failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Spawn `workers` tasks pulling keys from `queue` until shutdown.
///
/// Failures are logged per key and requeued according to their error
/// class; they never stop the pool.
pub fn run_workers<R: Reconciler>(
    reconciler: Arc<R>,
    queue: WorkQueue<R::Key>,
    workers: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(workers + 1);

    let watcher = queue.clone();
    handles.push(tokio::spawn(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        watcher.shutdown();
    }));

    for worker in 0..workers.max(1) {
        let reconciler = Arc::clone(&reconciler);
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            while let Some(key) = queue.get().await {
                process(reconciler.as_ref(), &queue, &key).await;
                queue.done(&key);
            }
            debug!(controller = reconciler.name(), worker, "worker stopped");
        }));
    }
    handles
}

async fn process<R: Reconciler>(reconciler: &R, queue: &WorkQueue<R::Key>, key: &R::Key) {
    match reconciler.reconcile(key).await {
        Ok(Action::Done) => queue.forget(key),
        Ok(Action::Requeue(delay)) => {
            queue.forget(key);
            queue.add_after(key.clone(), delay);
        }
        Err(e) => {
            let requeue = e.requeue();
            warn!(
                controller = reconciler.name(),
                %key,
                error = %e,
                ?requeue,
                attempts = queue.num_requeues(key),
                "reconcile failed"
            );
            match requeue {
                Requeue::Immediate => queue.add(key.clone()),
                Requeue::Backoff => queue.add_rate_limited(key.clone()),
                Requeue::Never => queue.forget(key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::error::ControllerError;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails each key a scripted number of times, and checks that no key
    /// is ever reconciled by two workers at once.
    struct Flaky {
        failures: Mutex<HashMap<String, u32>>,
        in_flight: Mutex<HashMap<String, bool>>,
        overlaps: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for Flaky {
        type Key = String;

        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn reconcile(&self, key: &String) -> ControllerResult<Action> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                if in_flight.insert(key.clone(), true) == Some(true) {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.lock().unwrap().insert(key.clone(), false);

            let mut failures = self.failures.lock().unwrap();
            let left = failures.entry(key.clone()).or_insert(0);
            if *left > 0 {
                *left -= 1;
                return Err(ControllerError::Transient("scripted".into()));
            }
            Ok(Action::Done)
        }
    }

    #[tokio::test]
    async fn workers_retry_and_serialize_per_key() {
        let reconciler = Arc::new(Flaky {
            failures: Mutex::new(HashMap::from([("a".to_string(), 2)])),
            in_flight: Mutex::new(HashMap::new()),
            overlaps: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        let queue = WorkQueue::new(Backoff::new(Duration::from_millis(1), Duration::from_millis(5)));
        let (tx, rx) = watch::channel(false);
        let handles = run_workers(Arc::clone(&reconciler), queue.clone(), 4, rx);

        for _ in 0..5 {
            queue.add("a".to_string());
            queue.add("b".to_string());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(reconciler.overlaps.load(Ordering::SeqCst), 0);
        assert!(reconciler.calls.load(Ordering::SeqCst) >= 4);
        assert_eq!(*reconciler.failures.lock().unwrap().get("a").unwrap(), 0);
        assert_eq!(queue.num_requeues(&"a".to_string()), 0);
    }

    struct Listing;

    #[async_trait]
    impl Reconciler for Listing {
        type Key = String;

        fn name(&self) -> &'static str {
            "listing"
        }

        async fn reconcile(&self, _key: &String) -> ControllerResult<Action> {
            Ok(Action::Done)
        }

        fn resync_keys(&self) -> ControllerResult<Vec<String>> {
            Ok(vec!["n1".to_string(), "n2".to_string()])
        }
    }

    #[tokio::test]
    async fn resync_enqueues_every_key() {
        let queue = WorkQueue::new(Backoff::default());
        let (tx, rx) = watch::channel(false);
        let task = spawn_resync(Arc::new(Listing), queue.clone(), Duration::from_millis(10), rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 2);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
