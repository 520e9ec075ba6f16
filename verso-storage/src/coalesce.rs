//! Request coalescing.
//!
//! Concurrent calls that share an [`OperationKey`] collapse into one backend
//! execution. The first caller to register becomes the leader and runs the
//! call; everyone registered behind it receives a clone of the leader's
//! outcome. A group lives only while its leader is running, so every wave of
//! concurrent calls is its own generation and nothing is remembered between
//! waves.
//!
//! The group map sits behind one mutex. Registration and
//! broadcast-with-removal are each a single critical section and the lock is
//! never held across an `.await`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use verso_core::{BoundArgs, CoalesceError};

/// Identity of a coalescible call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    operation: String,
    template: String,
    args: String,
    page: Option<u32>,
}

impl OperationKey {
    pub fn new(
        operation: impl Into<String>,
        template: impl Into<String>,
        args: &BoundArgs,
        page: Option<u32>,
    ) -> Self {
        Self {
            operation: operation.into(),
            template: template.into(),
            args: args.canonical(),
            page,
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]{}", self.operation, self.template, self.args)?;
        if let Some(page) = self.page {
            write!(f, "#p{}", page)?;
        }
        Ok(())
    }
}

type Groups<K, T> = HashMap<K, Vec<oneshot::Sender<T>>>;

/// Deduplicates concurrent identical calls.
///
/// Owned by whoever wires the cache layer together and shared behind an
/// `Arc`.
pub struct RequestCoalescer<K, T> {
    groups: Mutex<Groups<K, T>>,
}

impl<K, T> Default for RequestCoalescer<K, T> {
    fn default() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> fmt::Debug for RequestCoalescer<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("in_flight", &self.lock().len())
            .finish()
    }
}

impl<K, T> RequestCoalescer<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Groups<K, T>> {
        // Groups hold only channel senders; a poisoned map is still consistent.
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of groups with a leader still running.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}

impl<K, T> RequestCoalescer<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    /// Join the group for `key`, creating it if none is in flight.
    pub fn register(&self, key: K) -> Registration<'_, K, T> {
        let mut groups = self.lock();
        match groups.get_mut(&key) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                tracing::trace!(key = %key, waiters = waiters.len(), "joined in-flight call");
                Registration::Follower(Waiter {
                    key: key.to_string(),
                    rx,
                })
            }
            None => {
                groups.insert(key.clone(), Vec::new());
                tracing::trace!(key = %key, "leading new call generation");
                Registration::Leader(Leader {
                    coalescer: self,
                    key,
                    completed: false,
                })
            }
        }
    }

    /// Run `call` once for every concurrent caller sharing `key`.
    ///
    /// The leader's outcome is returned to all of them. Followers wait at
    /// most `timeout` when one is given.
    pub async fn run<F, Fut>(&self, key: K, timeout: Option<Duration>, call: F) -> Result<T, CoalesceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.register(key) {
            Registration::Leader(leader) => {
                let outcome = call().await;
                leader.complete(&outcome);
                Ok(outcome)
            }
            Registration::Follower(waiter) => waiter.wait(timeout).await,
        }
    }

    fn broadcast(&self, key: &K, outcome: &T) -> usize {
        let waiters = self.lock().remove(key).unwrap_or_default();
        let delivered = waiters.len();
        for tx in waiters {
            // A waiter that timed out has dropped its receiver.
            let _ = tx.send(outcome.clone());
        }
        delivered
    }

    fn abandon(&self, key: &K) {
        // Dropping the senders wakes every waiter with a receive error.
        self.lock().remove(key);
    }
}

/// Result of [`RequestCoalescer::register`].
pub enum Registration<'a, K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    /// First in: run the call, then [`Leader::complete`].
    Leader(Leader<'a, K, T>),
    /// A call is already running: wait for its outcome.
    Follower(Waiter<T>),
}

impl<K, T> Registration<'_, K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    pub fn is_leader(&self) -> bool {
        matches!(self, Registration::Leader(_))
    }
}

/// The executing member of a group.
///
/// Dropping it without calling [`Leader::complete`] (cancellation or a
/// panic in the call) clears the group and its waiters fail with
/// [`CoalesceError`].
pub struct Leader<'a, K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    coalescer: &'a RequestCoalescer<K, T>,
    key: K,
    completed: bool,
}

impl<K, T> Leader<'_, K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Remove the group and hand `outcome` to every waiter. Returns how many
    /// waiters were registered.
    pub fn complete(mut self, outcome: &T) -> usize {
        self.completed = true;
        let delivered = self.coalescer.broadcast(&self.key, outcome);
        if delivered > 0 {
            tracing::trace!(key = %self.key, delivered, "broadcast coalesced outcome");
        }
        delivered
    }
}

impl<K, T> Drop for Leader<'_, K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Clone,
{
    fn drop(&mut self) {
        if !self.completed {
            tracing::warn!(key = %self.key, "coalesced call abandoned before completing");
            self.coalescer.abandon(&self.key);
        }
    }
}

/// A non-executing member of a group.
pub struct Waiter<T> {
    key: String,
    rx: oneshot::Receiver<T>,
}

impl<T> Waiter<T> {
    /// Wait for the leader's outcome, at most `timeout` when given.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<T, CoalesceError> {
        let Waiter { key, rx } = self;
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(_)) => Err(CoalesceError::abandoned(key)),
                Err(_) => Err(CoalesceError::timed_out(key, limit)),
            },
            None => rx.await.map_err(|_| CoalesceError::abandoned(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_operation_key_identity() {
        let a = BoundArgs::new().bind("albumId", 1).unwrap().bind("q", "x").unwrap();
        let b = BoundArgs::new().bind("q", "x").unwrap().bind("albumId", 1).unwrap();
        let k1 = OperationKey::new("photo.list", "photo-l-d-album:albumId", &a, Some(2));
        let k2 = OperationKey::new("photo.list", "photo-l-d-album:albumId", &b, Some(2));
        let k3 = OperationKey::new("photo.list", "photo-l-d-album:albumId", &b, Some(3));
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1.operation(), "photo.list");
        assert!(k1.to_string().ends_with("#p2"));
    }

    #[test]
    fn test_register_leader_then_follower() {
        let coalescer: RequestCoalescer<String, i32> = RequestCoalescer::new();
        let first = coalescer.register("k".to_string());
        assert!(first.is_leader());
        let second = coalescer.register("k".to_string());
        assert!(!second.is_leader());
        assert_eq!(coalescer.in_flight(), 1);

        let other = coalescer.register("other".to_string());
        assert!(other.is_leader());
        assert_eq!(coalescer.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_complete_delivers_to_followers_and_clears() {
        let coalescer: RequestCoalescer<String, i32> = RequestCoalescer::new();
        let Registration::Leader(leader) = coalescer.register("k".to_string()) else {
            panic!("expected leader");
        };
        let Registration::Follower(waiter) = coalescer.register("k".to_string()) else {
            panic!("expected follower");
        };

        assert_eq!(leader.complete(&7), 1);
        assert_eq!(coalescer.in_flight(), 0);
        assert_eq!(waiter.wait(None).await.unwrap(), 7);

        // Next wave starts a fresh generation.
        assert!(coalescer.register("k".to_string()).is_leader());
    }

    #[tokio::test]
    async fn test_dropped_leader_wakes_waiters_with_error() {
        let coalescer: RequestCoalescer<String, i32> = RequestCoalescer::new();
        let leader = coalescer.register("k".to_string());
        let Registration::Follower(waiter) = coalescer.register("k".to_string()) else {
            panic!("expected follower");
        };
        drop(leader);

        assert_eq!(coalescer.in_flight(), 0);
        let err = waiter.wait(None).await.unwrap_err();
        assert!(matches!(err, CoalesceError::Incomplete { .. }));
    }

    #[tokio::test]
    async fn test_waiter_times_out() {
        let coalescer: RequestCoalescer<String, i32> = RequestCoalescer::new();
        let _leader = coalescer.register("k".to_string());
        let Registration::Follower(waiter) = coalescer.register("k".to_string()) else {
            panic!("expected follower");
        };

        let err = waiter.wait(Some(Duration::from_millis(20))).await.unwrap_err();
        match err {
            CoalesceError::Incomplete { key, reason } => {
                assert_eq!(key, "k");
                assert!(reason.contains("20ms"));
            }
        }
    }

    #[tokio::test]
    async fn test_run_executes_once_for_concurrent_callers() {
        let coalescer = Arc::new(RequestCoalescer::<String, serde_json::Value>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coalescer = coalescer.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("photo".to_string(), Some(Duration::from_secs(5)), || async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        json!({"id": 1})
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!({"id": 1}));
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared_outcomes() {
        let coalescer: RequestCoalescer<String, Result<i32, String>> = RequestCoalescer::new();
        let outcome = coalescer
            .run("k".to_string(), None, || async { Err("backend down".to_string()) })
            .await
            .unwrap();
        assert_eq!(outcome, Err("backend down".to_string()));
    }
}
