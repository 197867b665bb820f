use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
    time::Duration,
};

use futures::future::{self, BoxFuture, FutureExt, TryJoinAll};
use tracing::{debug, trace, warn};

use crate::{
    config::{with_deadline, LoaderConfig, Window},
    data::{KeySet, ValueSet},
    error::{LoadError, LoadResult},
    source::Source,
    wakerset::{WaiterId, WakerSet},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BatchId(u64);

type Fetch<S> = BoxFuture<'static, LoadResult<ValueSet<<S as Source>::Key, <S as Source>::Value>>>;

enum Phase<S: Source> {
    /// Still collecting keys. `enqueued` counts every load that joined, so
    /// the window can tell whether the last resolution pass added anything.
    Accum {
        keys: KeySet<S::Key>,
        window: Window,
        enqueued: usize,
    },

    Running(Fetch<S>),

    /// The fetch failed. Kept around until every waiting placeholder has
    /// taken its copy of the error.
    Failed(LoadError),
}

struct Batch<S: Source> {
    phase: Phase<S>,
    wakers: WakerSet,

    // Placeholders still attached to this batch.
    waiters: usize,

    // The batch's keys once it has left the Accum phase; used to clear
    // `in_flight` when it finishes.
    keys: Vec<S::Key>,
}

// Design notes:
//
// All state for one loader lives behind a single mutex: the request cache,
// the map of keys that are waiting on a batch, and the batches themselves.
// Placeholders hold the key and the id of their batch, and every poll goes
// through the lock. The lock is never held across an await; it is only held
// for the duration of a poll, which by definition is short.
//
// A successful batch is retired as soon as it completes. Its values move into
// the cache before any placeholder is handed its value, so a placeholder that
// finds its batch gone reads from the cache instead.
struct Shared<S: Source> {
    source: Arc<S>,
    config: LoaderConfig,
    closed: bool,
    cache: HashMap<S::Key, S::Value>,
    in_flight: HashMap<S::Key, BatchId>,
    batches: HashMap<BatchId, Batch<S>>,

    // The batch that new keys join, if it is still accepting them.
    accumulating: Option<BatchId>,

    // At most one fetch per loader runs at a time.
    running: Option<BatchId>,
    next_batch: u64,
}

fn lock<S: Source>(shared: &Mutex<Shared<S>>) -> MutexGuard<'_, Shared<S>> {
    // The mutex is only poisoned if a source panicked mid-poll, and this
    // crate is built with panic=abort, so that can't be observed in practice.
    shared.lock().expect("loader state poisoned")
}

fn cached<S: Source>(cache: &HashMap<S::Key, S::Value>, key: &S::Key) -> S::Value {
    match cache.get(key) {
        Some(value) => value.clone(),
        None => panic!(
            "Unknown logic error: {} batch retired without a value for {:?}",
            S::NAME,
            key
        ),
    }
}

fn start_fetch<S: Source>(source: &Arc<S>, keys: KeySet<S::Key>, timeout: Option<Duration>) -> Fetch<S> {
    let source = Arc::clone(source);

    async move {
        match with_deadline(source.fetch_batch(keys), timeout).await {
            Ok(result) => result.map_err(|error| LoadError::fetch(S::NAME, error)),
            Err(after) => Err(LoadError::Timeout {
                source_name: S::NAME,
                after,
            }),
        }
    }
    .boxed()
}

impl<S: Source> Shared<S> {
    fn open_batch(&mut self) -> BatchId {
        let id = BatchId(self.next_batch);
        self.next_batch += 1;

        self.batches.insert(
            id,
            Batch {
                phase: Phase::Accum {
                    keys: KeySet::new(),
                    window: self.config.open_window(),
                    enqueued: 0,
                },
                wakers: WakerSet::default(),
                waiters: 0,
                keys: Vec::new(),
            },
        );
        self.accumulating = Some(id);
        id
    }

    /// Attach a new requester for `key` to the batch that will resolve it,
    /// creating or joining the accumulating batch if no batch owns the key
    /// yet.
    fn enqueue(&mut self, key: S::Key) -> BatchId {
        if let Some(&id) = self.in_flight.get(&key) {
            if let Some(batch) = self.batches.get_mut(&id) {
                batch.waiters += 1;
                if let Phase::Accum { keys, enqueued, .. } = &mut batch.phase {
                    keys.add_key(key);
                    *enqueued += 1;
                }
                return id;
            }
        }

        let id = match self.accumulating {
            Some(id) => id,
            None => self.open_batch(),
        };

        let batch = match self.batches.get_mut(&id) {
            Some(batch) => batch,
            None => panic!("Unknown logic error: accumulating batch is missing"),
        };
        batch.waiters += 1;

        if let Phase::Accum {
            keys,
            window,
            enqueued,
        } = &mut batch.phase
        {
            keys.add_key(key.clone());
            *enqueued += 1;

            // If we've hit the key limit, close the window so that the batch
            // is issued on its next poll, and detach it so later keys start
            // a new batch.
            if let Some(max) = self.config.max_batch_size {
                if keys.len() >= max.get() {
                    *window = Window::Closed;
                    batch.wakers.wake_driver();
                    self.accumulating = None;
                }
            }
        }

        self.in_flight.insert(key, id);
        id
    }

    /// Drive batch `id` on behalf of the placeholder waiting for `key`.
    fn poll_batch(
        &mut self,
        id: BatchId,
        key: &S::Key,
        waiter: &mut Option<WaiterId>,
        ctx: &mut Context<'_>,
    ) -> Poll<LoadResult<S::Value>> {
        let batch = match self.batches.get_mut(&id) {
            Some(batch) => batch,
            None => return Poll::Ready(Ok(cached::<S>(&self.cache, key))),
        };

        match &mut batch.phase {
            Phase::Failed(error) => {
                let error = error.clone();
                *waiter = None;
                self.release_failed(id);
                return Poll::Ready(Err(error));
            }

            Phase::Accum {
                window, enqueued, ..
            } => {
                batch.wakers.register(waiter, ctx.waker());

                if window.poll_closed(ctx, *enqueued).is_pending() {
                    return Poll::Pending;
                }

                // The window stays closed even if the fetch has to wait for
                // another flush to finish.
                *window = Window::Closed;
                if self.accumulating == Some(id) {
                    self.accumulating = None;
                }

                if !self.try_start(id, ctx) {
                    return Poll::Pending;
                }
            }

            Phase::Running(..) => batch.wakers.register(waiter, ctx.waker()),
        }

        match self.poll_fetch(id, ctx) {
            Poll::Pending => Poll::Pending,

            // We're about to grab our result, so we don't need to wake
            // ourself.
            Poll::Ready(result) => match self.finish(id, result, waiter.take()) {
                Ok(()) => Poll::Ready(Ok(cached::<S>(&self.cache, key))),
                Err(error) => {
                    self.release_failed(id);
                    Poll::Ready(Err(error))
                }
            },
        }
    }

    /// Move batch `id` from Accum to Running, unless another flush of this
    /// loader is still running. In that case the running fetch is polled on
    /// our behalf, so that it makes progress even if its own placeholders
    /// are not being polled.
    fn try_start(&mut self, id: BatchId, ctx: &mut Context<'_>) -> bool {
        if let Some(running) = self.running {
            if let Poll::Ready(result) = self.poll_fetch(running, ctx) {
                // A failure belongs to the other batch's placeholders; they
                // pick it up from its Failed phase.
                if let Err(error) = self.finish(running, result, None) {
                    debug!(source = S::NAME, %error, "finished a failed flush for another batch");
                }
            }

            if self.running.is_some() {
                trace!(source = S::NAME, "batch waiting for the running flush");
                return false;
            }
        }

        let batch = match self.batches.get_mut(&id) {
            Some(batch) => batch,
            None => return false,
        };

        if let Phase::Accum { keys, .. } = &mut batch.phase {
            let keys = keys.take();
            debug!(source = S::NAME, keys = keys.len(), "flushing batch");

            batch.keys = keys.to_vec();
            batch.phase = Phase::Running(start_fetch(&self.source, keys, self.config.flush_timeout));
            self.running = Some(id);
        }

        true
    }

    fn poll_fetch(
        &mut self,
        id: BatchId,
        ctx: &mut Context<'_>,
    ) -> Poll<LoadResult<ValueSet<S::Key, S::Value>>> {
        match self.batches.get_mut(&id).map(|batch| &mut batch.phase) {
            Some(Phase::Running(fetch)) => fetch.poll_unpin(ctx),
            _ => Poll::Pending,
        }
    }

    /// Record the outcome of the running batch `id` and wake everyone
    /// waiting on it except `skip`.
    fn finish(
        &mut self,
        id: BatchId,
        result: LoadResult<ValueSet<S::Key, S::Value>>,
        skip: Option<WaiterId>,
    ) -> LoadResult<()> {
        self.running = None;
        self.wake_waiting_batches();

        match result {
            Ok(values) => {
                debug!(source = S::NAME, values = values.len(), "batch resolved");

                // Populate the cache before anyone sees a value, so that a
                // re-request made while handling one is a hit.
                if let Some(batch) = self.batches.remove(&id) {
                    for key in &batch.keys {
                        self.in_flight.remove(key);
                    }
                    self.cache.extend(values.into_entries());
                    batch.wakers.wake_all_except(skip.as_ref());
                }

                Ok(())
            }

            Err(error) => {
                warn!(source = S::NAME, %error, "batched fetch failed");

                // Failed keys are not cached; a later load starts over.
                if let Some(batch) = self.batches.get_mut(&id) {
                    for key in batch.keys.drain(..) {
                        self.in_flight.remove(&key);
                    }
                    batch.phase = Phase::Failed(error.clone());
                    mem::take(&mut batch.wakers).wake_all_except(skip.as_ref());
                }

                Err(error)
            }
        }
    }

    /// A placeholder took its copy of a failed batch's error.
    fn release_failed(&mut self, id: BatchId) {
        if let Some(batch) = self.batches.get_mut(&id) {
            batch.waiters -= 1;
            if batch.waiters == 0 {
                self.batches.remove(&id);
            }
        }
    }

    /// Batches whose window closed while another flush was running wait
    /// here; nudge them once the running flush is done.
    fn wake_waiting_batches(&self) {
        self.batches
            .values()
            .filter(|batch| matches!(batch.phase, Phase::Accum { .. }))
            .for_each(|batch| batch.wakers.wake_driver());
    }

    /// Detach a placeholder that is being dropped before it got its value.
    fn detach(&mut self, id: BatchId, key: &S::Key, waiter: Option<WaiterId>) {
        let batch = match self.batches.get_mut(&id) {
            Some(batch) => batch,
            None => return,
        };

        batch.waiters -= 1;

        // If we were the driving placeholder, another one has to be woken up
        // to take over.
        if let Some(waiter) = waiter {
            batch.wakers.discard_and_wake(waiter);
        }

        let retire = match &mut batch.phase {
            Phase::Accum { keys, .. } => {
                if keys.discard_key(key) {
                    self.in_flight.remove(key);
                }
                keys.is_empty()
            }
            Phase::Running(..) | Phase::Failed(..) => batch.waiters == 0,
        };

        if retire {
            if let Some(batch) = self.batches.remove(&id) {
                if matches!(batch.phase, Phase::Running(..)) {
                    debug!(source = S::NAME, keys = batch.keys.len(), "abandoning flush");
                    self.running = None;
                    self.wake_waiting_batches();
                }
                for key in &batch.keys {
                    self.in_flight.remove(key);
                }
            }

            if self.accumulating == Some(id) {
                self.accumulating = None;
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.cache.clear();
        self.in_flight.clear();
        self.accumulating = None;
        self.running = None;

        // Dropping the batches drops any fetch still in progress. Wake
        // everyone so they observe the teardown.
        for (_id, batch) in self.batches.drain() {
            batch.wakers.wake_all_except(None);
        }
    }
}

/// The per-request batching and caching front end for one [`Source`].
///
/// Handles are cheap to clone; every clone shares one pending batch and one
/// cache. A loader lives exactly as long as its
/// [`RequestScope`](crate::RequestScope): once the scope is torn down, the
/// loader refuses new loads and outstanding placeholders resolve to
/// [`LoadError::ScopeClosed`].
pub struct Loader<S: Source> {
    shared: Arc<Mutex<Shared<S>>>,
}

impl<S: Source> Clone for Loader<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Source> Debug for Loader<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Loader");
        out.field("source", &S::NAME);

        match self.shared.try_lock() {
            Ok(shared) => out
                .field("closed", &shared.closed)
                .field("cached", &shared.cache.len())
                .field("in_flight", &shared.in_flight.len())
                .field("batches", &shared.batches.len()),
            Err(..) => out.field("state", &"<locked>"),
        };

        out.finish()
    }
}

impl<S: Source> Loader<S> {
    pub fn new(source: S, config: LoaderConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                source: Arc::new(source),
                config,
                closed: false,
                cache: HashMap::new(),
                in_flight: HashMap::new(),
                batches: HashMap::new(),
                accumulating: None,
                running: None,
                next_batch: 0,
            })),
        }
    }

    /// Request the value for `key`.
    ///
    /// A cached key yields an already-resolved placeholder. Otherwise the
    /// key joins the batch that is already fetching or collecting it, or the
    /// currently accumulating batch; the returned placeholder resolves once
    /// that batch has been flushed.
    ///
    /// # Panics
    ///
    /// If the loader's request scope has been closed.
    pub fn load(&self, key: S::Key) -> Placeholder<S> {
        let mut shared = lock(&self.shared);

        if shared.closed {
            drop(shared);
            panic!("{} loader used after its request scope closed", S::NAME);
        }

        let slot = match shared.cache.get(&key) {
            Some(value) => {
                trace!(source = S::NAME, ?key, "cache hit");
                Slot::Cached(value.clone())
            }
            None => Slot::Waiting {
                batch: shared.enqueue(key.clone()),
                waiter: None,
            },
        };

        drop(shared);

        Placeholder {
            key,
            slot,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Request several keys at once. The values come back in the order of
    /// `keys`, duplicates included. Fails with the first error.
    pub fn load_many(&self, keys: impl IntoIterator<Item = S::Key>) -> TryJoinAll<Placeholder<S>> {
        future::try_join_all(keys.into_iter().map(|key| self.load(key)))
    }

    /// Seed the cache with a value obtained some other way. Returns false,
    /// leaving the cache untouched, if the key is already cached.
    pub fn prime(&self, key: S::Key, value: S::Value) -> bool {
        let mut shared = lock(&self.shared);
        if shared.closed || shared.cache.contains_key(&key) {
            return false;
        }

        shared.cache.insert(key, value);
        true
    }

    /// Close the accumulation window of the pending batch, so that the next
    /// poll of one of its placeholders issues the fetch. Keys loaded after
    /// this call start a new batch.
    pub fn flush(&self) {
        let mut guard = lock(&self.shared);
        let shared = &mut *guard;

        if let Some(id) = shared.accumulating.take() {
            if let Some(batch) = shared.batches.get_mut(&id) {
                if let Phase::Accum { window, .. } = &mut batch.phase {
                    *window = Window::Closed;
                }
                batch.wakers.wake_driver();
            }
        }
    }

    /// The number of distinct keys waiting in the accumulating batch.
    pub fn pending_keys(&self) -> usize {
        let shared = lock(&self.shared);

        shared
            .accumulating
            .and_then(|id| shared.batches.get(&id))
            .map(|batch| match &batch.phase {
                Phase::Accum { keys, .. } => keys.len(),
                _ => 0,
            })
            .unwrap_or(0)
    }

    pub fn is_cached(&self, key: &S::Key) -> bool {
        lock(&self.shared).cache.contains_key(key)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared).closed
    }

    /// Tear the loader down. Called by the owning request scope.
    pub(crate) fn close(&self) {
        lock(&self.shared).close();
    }
}

enum Slot<Value> {
    Cached(Value),
    Waiting {
        batch: BatchId,
        waiter: Option<WaiterId>,
    },
    Done,
}

/// A deferred value returned by [`Loader::load`]. Resolves once the batch
/// holding its key has been flushed (or immediately, on a cache hit).
///
/// Placeholders drive the batch themselves: the first one polled after the
/// accumulation window closes issues the fetch, and the rest are woken with
/// the result. Dropping a placeholder withdraws its interest; if it was the
/// last one waiting on a key that hasn't been fetched yet, the key is removed
/// from the batch.
pub struct Placeholder<S: Source> {
    key: S::Key,
    slot: Slot<S::Value>,
    shared: Arc<Mutex<Shared<S>>>,
}

// Nothing inside a Placeholder is ever pinned; fetch futures are boxed inside
// the shared state.
impl<S: Source> Unpin for Placeholder<S> {}

impl<S: Source> Placeholder<S> {
    pub fn key(&self) -> &S::Key {
        &self.key
    }
}

impl<S: Source> Future for Placeholder<S> {
    type Output = LoadResult<S::Value>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        let mut shared = lock(&this.shared);

        match mem::replace(&mut this.slot, Slot::Done) {
            Slot::Done => {
                drop(shared);
                panic!("Can't re-poll a completed Placeholder");
            }

            // Results must not escape a torn-down scope.
            _ if shared.closed => Poll::Ready(Err(LoadError::ScopeClosed {
                source_name: S::NAME,
            })),

            Slot::Cached(value) => Poll::Ready(Ok(value)),

            Slot::Waiting { batch, mut waiter } => {
                let poll = shared.poll_batch(batch, &this.key, &mut waiter, ctx);
                if poll.is_pending() {
                    this.slot = Slot::Waiting { batch, waiter };
                }
                poll
            }
        }
    }
}

impl<S: Source> Drop for Placeholder<S> {
    fn drop(&mut self) {
        if let Slot::Waiting { batch, waiter } = mem::replace(&mut self.slot, Slot::Done) {
            if let Ok(mut shared) = self.shared.lock() {
                shared.detach(batch, &self.key, waiter);
            }
        }
    }
}
