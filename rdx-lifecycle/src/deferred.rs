//! Single-shot values that are settled from outside the code awaiting them.
//!
//! A [`Deferred`] turns a one-directional bus notification into something a
//! task can `.await`: one side keeps the `Deferred` and later calls
//! [`Deferred::resolve`] or [`Deferred::reject`], the other side awaits the
//! [`Promise`] taken from it. Settlement happens at most once; later calls are
//! ignored. Dropping an unsettled `Deferred` completes its promise with
//! [`Abandoned`].
//!
//! A [`DeferredMap`] holds one `Deferred` per key (component id) and offers the
//! aggregate "every member resolved" future used by handlers and the server.

use crate::error::Abandoned;
use futures::future::{join_all, try_join_all};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// An externally settled, single-shot result.
pub struct Deferred<T, E> {
    settle: Mutex<Option<oneshot::Sender<Result<T, E>>>>,
    wait: Mutex<Option<oneshot::Receiver<Result<T, E>>>>,
}

impl<T, E> Deferred<T, E> {
    /// Creates a new, unsettled `Deferred`.
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            settle: Mutex::new(Some(tx)),
            wait: Mutex::new(Some(rx)),
        }
    }

    /// Resolves with `value`. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle_with(Ok(value))
    }

    /// Rejects with `error`. Returns `false` if already settled.
    pub fn reject(&self, error: E) -> bool {
        self.settle_with(Err(error))
    }

    /// Returns `true` once `resolve` or `reject` has been called.
    pub fn is_settled(&self) -> bool {
        lock(&self.settle).is_none()
    }

    /// Takes the awaiting side.
    ///
    /// There is exactly one promise per `Deferred`; asking again yields a
    /// promise that completes with [`Abandoned`] immediately.
    pub fn promise(&self) -> Promise<T, E> {
        Promise {
            rx: lock(&self.wait).take(),
            _marker: PhantomData,
        }
    }

    fn settle_with(&self, outcome: Result<T, E>) -> bool {
        match lock(&self.settle).take() {
            // A dropped promise is not an error for the settling side.
            Some(tx) => {
                tx.send(outcome).ok();
                true
            }
            None => false,
        }
    }
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> std::fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// The awaiting side of a [`Deferred`].
#[must_use = "promises do nothing unless awaited"]
pub struct Promise<T, E> {
    rx: Option<oneshot::Receiver<Result<T, E>>>,
    _marker: PhantomData<fn() -> E>,
}

impl<T, E: From<Abandoned>> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Err(Abandoned.into()));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Abandoned.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// An ordered mapping from key to a fresh [`Deferred`].
///
/// Created anew for every round that waits on a set of parties, so results
/// from a previous round can never settle an entry of the current one.
pub struct DeferredMap<T, E> {
    entries: Vec<(String, Deferred<T, E>)>,
}

impl<T, E> DeferredMap<T, E> {
    /// Creates one unsettled `Deferred` per key, keeping the key order.
    pub fn from_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            entries: keys
                .into_iter()
                .map(|key| (key.into(), Deferred::new()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Deferred<T, E>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, deferred)| deferred)
    }

    /// Resolves the entry for `key`. Returns `false` for unknown keys or
    /// entries that were already settled.
    pub fn resolve(&self, key: &str, value: T) -> bool {
        self.get(key).map_or(false, |d| d.resolve(value))
    }

    /// Rejects the entry for `key`. Returns `false` for unknown keys or
    /// entries that were already settled.
    pub fn reject(&self, key: &str, error: E) -> bool {
        self.get(key).map_or(false, |d| d.reject(error))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries still waiting to be settled.
    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|(_, d)| !d.is_settled()).count()
    }
}

impl<T, E: From<Abandoned>> DeferredMap<T, E> {
    /// The conjunction of every member: resolves with `(key, value)` pairs in
    /// key order once all resolved, rejects with the first rejection without
    /// waiting for the rest.
    ///
    /// Must be called before the entries are settled; it takes each member's
    /// promise.
    pub fn all(&self) -> impl Future<Output = Result<Vec<(String, T)>, E>> + Send + 'static
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let waits = self.entries.iter().map(|(key, deferred)| {
            let key = key.clone();
            let promise = deferred.promise();
            async move { promise.await.map(|value| (key, value)) }
        });
        try_join_all(waits)
    }

    /// Waits for every member to settle and reports each outcome in key order.
    pub fn settle_all(&self) -> impl Future<Output = Vec<(String, Result<T, E>)>> + Send + 'static
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let waits = self.entries.iter().map(|(key, deferred)| {
            let key = key.clone();
            let promise = deferred.promise();
            async move { (key, promise.await) }
        });
        join_all(waits)
    }
}

// The inner mutexes only guard an `Option` swap, so a poisoned lock still
// holds consistent data.
fn lock<V>(m: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
