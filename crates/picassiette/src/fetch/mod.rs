//! # Fetch coordination
//!
//! [`Picassiette`] hands out values for string keys to [`Target`]s. A target is bound to at most
//! one key at a time, and only ever receives the result for the key it is currently bound to.
//!
//! A call to [`Picassiette::fetch`] goes through the following steps:
//!
//! - The in-memory cache is consulted synchronously. On a hit, whatever the target was fetching
//!   before is cancelled and the value is delivered right away.
//! - On a miss, a new request is registered on the target. If the target is already fetching the
//!   same key, nothing happens and the running fetch will deliver. If it is fetching another key,
//!   that fetch is cancelled without waiting for it.
//! - The persistent store is consulted in the background. A hit is delivered like a memory hit,
//!   unless the target has been rebound in the meantime.
//! - Only if both tiers miss, [`Target::on_pre_receive`] is scheduled and a fetch task is spawned,
//!   which runs the producer on the blocking pool.
//! - The result is stored in the in-memory cache and delivered to the target, unless the target has
//!   been rebound or the task was cancelled in the meantime.
//!
//! Producer failures and panics are logged and delivered as `None`. They are never cached, so the
//! next fetch of the same key runs the producer again.
//!
//! ## Delivery
//!
//! All target callbacks run on a single delivery context, see [`Dispatcher`]. Results are checked
//! against the target's [`TargetHandle`] on that context, which makes "is this still the task the
//! target is waiting for" and "deliver" a single step.
//!
//! ## Cancellation
//!
//! Every task holds a child of the coordinator's root [`CancellationToken`]. Cancellation is
//! cooperative and checked before the producer runs, after it returns, and right before delivery.
//! A producer that is already running is never interrupted.
//!
//! ### Metrics
//!
//! - `fetch.computation`: Producers that were actually run.
//! - `fetch.running`: A gauge of fetch tasks in flight.
//! - `fetch.failed`: Failed producers, tagged with a `reason`.
//! - `fetch.resource_exhausted`: Failures that triggered an emergency eviction.
//! - `fetch.delivered` / `fetch.superseded`: Results that were delivered or discarded.

use std::any::Any;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::caching::{CacheEngine, Codec, MemoryCache, Payload, PersistentStore, Weigher};
use crate::config::{
    Config, DEFAULT_DISK_CAPACITY, DEFAULT_DISK_NAMESPACE, DEFAULT_MEMORY_CAPACITY,
};

mod delivery;
mod target;
mod task;


pub use delivery::{Dispatcher, Job, SerialDispatcher};
pub use target::{Target, TargetHandle};
pub use task::ResourceExhausted;

use target::{Request, TaskTicket};
use task::FetchTask;

/// Produces the value for a key on a cache miss.
///
/// Producers run on the blocking pool and may block, fail, or panic.
pub type Producer<P, A> = Arc<dyn Fn(&str, &A) -> anyhow::Result<Option<P>> + Send + Sync>;

/// An error building a [`Picassiette`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// Neither an explicit runtime was given, nor was `build` called from within one.
    #[error("no tokio runtime available")]
    NoRuntime,
    /// The persistent store directory could not be created.
    #[error("failed to create cache directory")]
    Io(#[from] io::Error),
}

/// Everything a fetch task needs, shared between the coordinator and its tasks.
pub(crate) struct FetchContext<P, A> {
    cache: Option<CacheEngine<P>>,
    producer: Producer<P, A>,
    dispatcher: Arc<dyn Dispatcher>,
    limiter: Option<Arc<Semaphore>>,
    runtime: Handle,
    running: AtomicU64,
    next_task_id: AtomicU64,
    tasks: TaskTracker,
}

impl<P: Payload, A: Send + Sync + 'static> FetchContext<P, A> {
    /// Binds a new task to `request` and spawns it, unless the target moved on in the meantime.
    fn start(
        self: &Arc<Self>,
        request: u64,
        key: Arc<str>,
        params: A,
        token: CancellationToken,
        target: Weak<dyn Target<P, A>>,
    ) {
        let Some(strong) = target.upgrade() else {
            return;
        };
        let ticket = strong.handle().bind(request, || TaskTicket {
            id: self.next_task_id.fetch_add(1, Ordering::Relaxed),
            key,
            token,
        });
        drop(strong);
        let Some(ticket) = ticket else {
            tracing::debug!("Target was rebound before its fetch started");
            return;
        };

        let params = Arc::new(params);
        {
            let target = target.clone();
            let key = Arc::clone(&ticket.key);
            let params = Arc::clone(&params);
            self.dispatcher.dispatch(Box::new(move || {
                if let Some(target) = target.upgrade() {
                    target.on_pre_receive(&key, &params);
                }
            }));
        }

        tracing::debug!(task = ticket.id, key = &*ticket.key, "Starting fetch");
        let task = FetchTask::new(ticket, params, target, Arc::clone(self));
        self.tasks.spawn_on(task.run(), &self.runtime);
    }

    /// Delivers a value found in the persistent store for `request`.
    fn deliver_stored(
        &self,
        request: u64,
        token: CancellationToken,
        target: Weak<dyn Target<P, A>>,
        value: P,
    ) {
        self.dispatcher.dispatch(Box::new(move || {
            let Some(target) = target.upgrade() else {
                return;
            };
            if token.is_cancelled() || !target.handle().is_current(request) {
                metric!(counter("fetch.superseded") += 1);
                tracing::debug!("Discarding persistent store hit of rebound target");
                return;
            }
            metric!(counter("fetch.delivered") += 1);
            target.on_receive(Some(value));
        }));
    }
}

struct Inner<P, A> {
    context: Arc<FetchContext<P, A>>,
    root: Mutex<CancellationToken>,
    idle_lock: AsyncMutex<()>,
}

impl<P, A> Drop for Inner<P, A> {
    fn drop(&mut self) {
        let root = self.root.get_mut().unwrap_or_else(|e| e.into_inner());
        root.cancel();
    }
}

/// A two-tier cache with per-target fetch coordination.
///
/// Cloning is cheap and all clones share the same caches and tasks. Once the last clone is dropped,
/// every outstanding fetch is cancelled.
pub struct Picassiette<P, A = ()> {
    inner: Arc<Inner<P, A>>,
}

impl<P, A> Clone for Picassiette<P, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, A> fmt::Debug for Picassiette<P, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let context = &self.inner.context;
        f.debug_struct("Picassiette")
            .field("cache", &context.cache)
            .field("running", &context.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl<P: Payload, A: Send + Sync + 'static> Picassiette<P, A> {
    /// Starts building a coordinator around `producer`.
    pub fn builder<F>(producer: F) -> PicassietteBuilder<P, A>
    where
        F: Fn(&str, &A) -> anyhow::Result<Option<P>> + Send + Sync + 'static,
    {
        PicassietteBuilder::new(Arc::new(producer))
    }

    /// Fetches the value for `key` and delivers it to `target`.
    ///
    /// Returns immediately. `target` is only held weakly by the fetch, and receives the value on
    /// the delivery context unless it gets rebound to another key first.
    pub fn fetch<T>(&self, key: &str, params: A, target: &Arc<T>)
    where
        T: Target<P, A>,
    {
        let context = &self.inner.context;

        if let Some(cache) = &context.cache {
            metric!(counter("caches.access") += 1);
            if let Some(value) = cache.lookup_memory(key) {
                target.handle().cancel_current();
                tracing::trace!(key, "Delivering from memory");

                let target = Arc::downgrade(target);
                context.dispatcher.dispatch(Box::new(move || {
                    if let Some(target) = target.upgrade() {
                        metric!(counter("fetch.delivered") += 1);
                        target.on_receive(Some(value));
                    }
                }));
                return;
            }
        }

        let request = match target.handle().begin(key) {
            Request::AlreadyFetching => {
                tracing::debug!(key, "Target is already fetching this key");
                return;
            }
            Request::Pending(request) => request,
        };

        let key: Arc<str> = key.into();
        let token = self.inner.root.lock().unwrap().child_token();
        let weak = Arc::downgrade(target);
        let weak: Weak<dyn Target<P, A>> = weak;

        let has_disk = context.cache.as_ref().is_some_and(|cache| cache.disk().is_some());
        if !has_disk {
            context.start(request, key, params, token, weak);
            return;
        }

        let lookup_context = Arc::clone(context);
        let lookup = async move {
            let context = lookup_context;
            let Some(cache) = &context.cache else {
                return;
            };
            let stored = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                stored = cache.lookup_disk(&key) => stored,
            };
            match stored {
                Some(value) => {
                    tracing::trace!(key = &*key, "Delivering from persistent store");
                    context.deliver_stored(request, token, weak, value);
                }
                None => context.start(request, key, params, token, weak),
            }
        };
        context.tasks.spawn_on(lookup, &context.runtime);
    }

    /// Empties the in-memory cache and resets the persistent store.
    ///
    /// Does nothing if caching is disabled.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.inner.context.cache {
            tracing::debug!("Clearing caches");
            cache.evict_all_and_reset_disk();
        }
    }

    /// Cancels every outstanding fetch.
    ///
    /// Cancelled fetches never deliver. Fetches started afterwards run normally.
    pub fn cancel_all(&self) {
        let previous = std::mem::take(&mut *self.inner.root.lock().unwrap());
        tracing::debug!("Cancelling all fetches");
        previous.cancel();
    }

    /// The cache layers, or `None` if caching is disabled.
    pub fn cache(&self) -> Option<&CacheEngine<P>> {
        self.inner.context.cache.as_ref()
    }

    /// Waits until every fetch started so far has finished, and its result has gone through the
    /// delivery context.
    ///
    /// This relies on the [`Dispatcher`] running jobs in order.
    pub async fn wait_idle(&self) {
        let context = &self.inner.context;
        let _guard = self.inner.idle_lock.lock().await;
        context.tasks.close();
        context.tasks.wait().await;
        context.tasks.reopen();

        let (tx, rx) = oneshot::channel();
        context.dispatcher.dispatch(Box::new(move || {
            let _ = tx.send(());
        }));
        let _ = rx.await;
    }
}

/// Builder for [`Picassiette`], created by [`Picassiette::builder`].
pub struct PicassietteBuilder<P, A = ()> {
    producer: Producer<P, A>,
    caching_enabled: bool,
    memory_capacity: u64,
    disk_capacity: u64,
    disk_namespace: String,
    cache_dir: Option<PathBuf>,
    max_concurrent_fetches: Option<usize>,
    size_of: Option<Weigher<P>>,
    codec: Option<Arc<dyn Codec<P>>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    runtime: Option<Handle>,
}

impl<P: Payload, A: Send + Sync + 'static> PicassietteBuilder<P, A> {
    fn new(producer: Producer<P, A>) -> Self {
        Self {
            producer,
            caching_enabled: true,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            disk_capacity: DEFAULT_DISK_CAPACITY,
            disk_namespace: DEFAULT_DISK_NAMESPACE.into(),
            cache_dir: None,
            max_concurrent_fetches: None,
            size_of: None,
            codec: None,
            dispatcher: None,
            runtime: None,
        }
    }

    /// Applies the `cache_dir` and `cache` sections of a [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        let cache = &config.cache;
        self.caching_enabled = cache.caching_enabled;
        self.memory_capacity = cache.memory_capacity;
        self.disk_capacity = cache.disk_capacity;
        self.disk_namespace = cache.disk_namespace.clone();
        self.max_concurrent_fetches = cache.max_concurrent_fetches;
        self.cache_dir = config.cache_dir.clone();
        self
    }

    pub fn caching_enabled(mut self, enabled: bool) -> Self {
        self.caching_enabled = enabled;
        self
    }

    /// Capacity of the in-memory cache, in the units of the size function.
    pub fn memory_capacity(mut self, capacity: u64) -> Self {
        self.memory_capacity = capacity;
        self
    }

    /// Capacity of the persistent store, in bytes.
    pub fn disk_capacity(mut self, capacity: u64) -> Self {
        self.disk_capacity = capacity;
        self
    }

    pub fn disk_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.disk_namespace = namespace.into();
        self
    }

    /// Enables the persistent store in `<dir>/<namespace>`.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn max_concurrent_fetches(mut self, limit: usize) -> Self {
        self.max_concurrent_fetches = Some(limit);
        self
    }

    /// Overrides [`Payload::weight`] as the size of in-memory entries.
    pub fn size_of<F>(mut self, size_of: F) -> Self
    where
        F: Fn(&str, &P) -> u64 + Send + Sync + 'static,
    {
        self.size_of = Some(Arc::new(size_of));
        self
    }

    /// Overrides the codec of the payload type.
    pub fn codec<C: Codec<P>>(mut self, codec: C) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Runs target callbacks on `dispatcher` instead of a [`SerialDispatcher`].
    pub fn dispatcher<D: Dispatcher>(mut self, dispatcher: D) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Runs tasks on `runtime` instead of the runtime `build` is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Picassiette<P, A>, BuildError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| BuildError::NoRuntime)?,
        };

        let cache = if self.caching_enabled {
            let weigher: Weigher<P> = match self.size_of {
                Some(size_of) => size_of,
                None => Arc::new(|_: &str, value: &P| value.weight()),
            };
            let codec: Arc<dyn Codec<P>> = match self.codec {
                Some(codec) => codec,
                None => Arc::new(P::Codec::default()),
            };
            let disk = match &self.cache_dir {
                Some(cache_dir) => {
                    let dir = cache_dir.join(&self.disk_namespace);
                    fs::create_dir_all(&dir)?;
                    Some(PersistentStore::new(dir, self.disk_capacity))
                }
                None => None,
            };
            let memory = MemoryCache::new(self.memory_capacity, weigher);
            Some(CacheEngine::new(memory, disk, codec, runtime.clone()))
        } else {
            None
        };

        let dispatcher: Arc<dyn Dispatcher> = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(SerialDispatcher::spawn(&runtime)),
        };

        tracing::debug!(
            caching_enabled = self.caching_enabled,
            memory_capacity = self.memory_capacity,
            disk_capacity = self.disk_capacity,
            cache_dir = ?self.cache_dir,
            "Created fetch coordinator"
        );

        let context = FetchContext {
            cache,
            producer: self.producer,
            dispatcher,
            limiter: self
                .max_concurrent_fetches
                .map(|limit| Arc::new(Semaphore::new(limit.max(1)))),
            runtime,
            running: AtomicU64::new(0),
            next_task_id: AtomicU64::new(0),
            tasks: TaskTracker::new(),
        };

        Ok(Picassiette {
            inner: Arc::new(Inner {
                context: Arc::new(context),
                root: Mutex::new(CancellationToken::new()),
                idle_lock: AsyncMutex::new(()),
            }),
        })
    }
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
