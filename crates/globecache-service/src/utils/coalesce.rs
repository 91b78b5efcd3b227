use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::Shared;
use tokio::sync::oneshot;

use crate::caching::CacheError;

type ComputationChannel<T> = Shared<oneshot::Receiver<Result<T, CacheError>>>;

/// Deduplicates concurrent computations by key.
///
/// The first caller for a key spawns the computation as a separate task. Every caller that
/// arrives while it is still running awaits the same result instead of starting another one.
/// The spawned task runs to completion even when all callers have gone away.
#[derive(Debug)]
pub struct Coalescer<K, T> {
    current: Arc<Mutex<HashMap<K, ComputationChannel<T>>>>,
}

impl<K, T> Default for Coalescer<K, T> {
    fn default() -> Self {
        Self {
            current: Arc::default(),
        }
    }
}

impl<K, T> Clone for Coalescer<K, T> {
    fn clone(&self) -> Self {
        Self {
            current: self.current.clone(),
        }
    }
}

impl<K, T> Coalescer<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Runs the computation created by `make` for `key`, unless one is already running.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the computation
    /// on the runtime, even if the returned future is never awaited.
    pub fn run<F, Fut>(
        &self,
        key: K,
        make: F,
    ) -> impl Future<Output = Result<T, CacheError>> + use<K, T, F, Fut>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let channel = {
            let mut current = lock(&self.current);
            match current.get(&key) {
                Some(channel) => {
                    metric!(counter("coalesce.channel.hit") += 1);
                    channel.clone()
                }
                None => {
                    metric!(counter("coalesce.channel.miss") += 1);
                    let channel = self.spawn(key.clone(), make());
                    current.insert(key, channel.clone());
                    channel
                }
            }
        };

        async move {
            // The sender is only dropped without a value if the task panicked.
            channel.await.unwrap_or(Err(CacheError::InternalError))
        }
    }

    fn spawn<Fut>(&self, key: K, computation: Fut) -> ComputationChannel<T>
    where
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let remove_token = RemoveOnDrop {
            current: self.current.clone(),
            key: Some(key),
        };

        tokio::spawn(async move {
            let result = computation.await;
            // Remove from the map first. This ensures that callers either get a channel that
            // will receive data, or they start a new computation.
            drop(remove_token);
            sender.send(result).ok();
        });

        receiver.shared()
    }

    /// The number of computations currently running.
    pub fn in_flight(&self) -> usize {
        lock(&self.current).len()
    }
}

fn lock<K, T>(
    current: &Mutex<HashMap<K, ComputationChannel<T>>>,
) -> MutexGuard<'_, HashMap<K, ComputationChannel<T>>> {
    current.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a finished (or panicked) computation from the map.
struct RemoveOnDrop<K: Eq + Hash, T> {
    current: Arc<Mutex<HashMap<K, ComputationChannel<T>>>>,
    key: Option<K>,
}

impl<K: Eq + Hash, T> Drop for RemoveOnDrop<K, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock(&self.current).remove(&key);
        }
    }
}
