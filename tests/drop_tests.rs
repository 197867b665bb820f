//! These tests ensure that dropped placeholders correctly update the shared
//! state
use async_trait::async_trait;
use cooked_waker::{IntoWaker, Wake, WakeRef};
use forumloader::{KeySet, Loader, LoaderConfig, Source, StoreResult, ValueSet};
use futures::{executor, FutureExt};
use futures_timer::Delay;
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::Context,
    thread,
    time::Duration,
};

/// A Waker that does nothing. Used for when we're manually calling poll.
#[derive(Debug, Default, Copy, Clone, IntoWaker)]
struct NoOpWaker;

impl WakeRef for NoOpWaker {
    fn wake_by_ref(&self) {}
}

impl Wake for NoOpWaker {
    fn wake(self) {}
}

/// Put a copy of each key in an Arc in the result. This lets us watch how
/// many handles to a value are alive.
#[derive(Debug, Clone, Default)]
struct PutKeysInArc;

#[async_trait]
impl Source for PutKeysInArc {
    type Key = i32;
    type Value = Arc<i32>;
    const NAME: &'static str = "put_keys_in_arc";

    async fn fetch_batch(&self, keys: KeySet<i32>) -> StoreResult<ValueSet<i32, Arc<i32>>> {
        Ok(keys.into_values(|key| Arc::new(*key)))
    }
}

/// Asserts that precisely the keys 1 and 2 are present in the key set
#[derive(Debug, Clone, Default)]
struct ExpectOneAndTwo;

#[async_trait]
impl Source for ExpectOneAndTwo {
    type Key = i32;
    type Value = i32;
    const NAME: &'static str = "expect_one_and_two";

    async fn fetch_batch(&self, keys: KeySet<i32>) -> StoreResult<ValueSet<i32, i32>> {
        assert_eq!(keys.len(), 2);

        let keys_vec: Vec<&i32> = keys.keys().collect();
        assert!(keys_vec.contains(&&1));
        assert!(keys_vec.contains(&&2));

        Ok(keys.into_values(|key| *key))
    }
}

/// Takes a little while, counting the fetches that started and finished.
#[derive(Debug, Clone, Default)]
struct Slow {
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl Slow {
    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for Slow {
    type Key = i32;
    type Value = i32;
    const NAME: &'static str = "slow";

    async fn fetch_batch(&self, keys: KeySet<i32>) -> StoreResult<ValueSet<i32, i32>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Delay::new(Duration::from_millis(20)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);

        Ok(keys.into_values(|key| *key))
    }
}

/// This test establishes a baseline behavior for our clone counters
#[test]
fn test_simple_drop_after_resolution() {
    let loader = Loader::new(PutKeysInArc, LoaderConfig::default());

    let fut1 = loader.load(1);
    let fut2 = loader.load(1);
    let fut3 = loader.load(1);
    let fut4 = loader.load(1);

    let res1 = executor::block_on(fut1).unwrap();

    // At this point, the cache and our local fut1 result should both have an
    // Arc
    assert_eq!(Arc::strong_count(&res1), 2);

    // Resolving fut2 simply clones the cached Arc
    let res2 = executor::block_on(fut2).unwrap();
    assert_eq!(Arc::strong_count(&res2), 3);

    // Dropping this placeholder shouldn't change anything
    drop(fut3);
    assert_eq!(Arc::strong_count(&res1), 3);

    // fut4 still holds the loader's state, cache included
    drop(loader);
    assert_eq!(Arc::strong_count(&res1), 3);

    // Dropping the last handle to the state drops the cache
    drop(fut4);
    assert_eq!(Arc::strong_count(&res1), 2);
}

#[test]
fn test_drop_during_delay() {
    let loader = Loader::new(
        ExpectOneAndTwo,
        LoaderConfig::default().with_window(Duration::from_millis(10)),
    );

    let waker = NoOpWaker;
    let waker = waker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1);
    let fut11 = loader.load(1);
    let fut2 = loader.load(2);
    let fut3 = loader.load(3);

    // This poll initiates the delay. We'll drop placeholders in this phase,
    // then confirm that the dropped keys weren't in the batched set.
    let poll = Pin::new(&mut fut1).poll(&mut ctx);
    assert!(poll.is_pending());

    drop(fut11);
    drop(fut3);
    assert_eq!(loader.pending_keys(), 2);

    let result: i32 = executor::block_on(fut1).unwrap();
    assert_eq!(result, 1);

    let result: i32 = executor::block_on(fut2).unwrap();
    assert_eq!(result, 2);
}

#[test]
fn test_drop_only_key_retires_batch() {
    let source = Slow::default();
    let loader = Loader::new(source.clone(), LoaderConfig::default());

    let fut1 = loader.load(1);
    assert_eq!(loader.pending_keys(), 1);

    drop(fut1);
    assert_eq!(loader.pending_keys(), 0);

    assert_eq!(executor::block_on(loader.load(2)).unwrap(), 2);
    assert_eq!(source.started(), 1);
}

#[test]
fn test_drop_while_fetch_is_running() {
    let source = Slow::default();
    let loader = Loader::new(source.clone(), LoaderConfig::default());

    let waker = NoOpWaker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1);

    // The first poll opens the window; the second sees no new keys, closes
    // it, and starts the fetch.
    assert!(fut1.poll_unpin(&mut ctx).is_pending());
    assert!(fut1.poll_unpin(&mut ctx).is_pending());
    assert_eq!(source.started(), 1);

    // Nobody is waiting any more, so the fetch is abandoned.
    drop(fut1);
    thread::sleep(Duration::from_millis(40));
    assert_eq!(source.finished(), 0);
    assert!(!loader.is_cached(&1));

    // A new load starts over.
    assert_eq!(executor::block_on(loader.load(1)).unwrap(), 1);
    assert_eq!(source.started(), 2);
    assert_eq!(source.finished(), 1);
}

#[test]
fn test_drop_driver_while_fetch_is_running() {
    let source = Slow::default();
    let loader = Loader::new(source.clone(), LoaderConfig::default());

    let waker = NoOpWaker.into_waker();
    let mut ctx = Context::from_waker(&waker);

    let mut fut1 = loader.load(1);
    let fut2 = loader.load(1);

    assert!(fut1.poll_unpin(&mut ctx).is_pending());
    assert!(fut1.poll_unpin(&mut ctx).is_pending());
    assert_eq!(source.started(), 1);

    // fut2 is still waiting, so the fetch carries on under a new driver.
    drop(fut1);
    assert_eq!(executor::block_on(fut2).unwrap(), 1);
    assert_eq!(source.started(), 1);
    assert_eq!(source.finished(), 1);
}

#[test]
#[should_panic(expected = "re-poll")]
fn test_result_poll_after_completion_panics() {
    let loader = Loader::new(PutKeysInArc, LoaderConfig::default());
    let mut fut = loader.load(1);

    assert_eq!(*executor::block_on(&mut fut).unwrap(), 1);

    let waker = NoOpWaker.into_waker();
    let mut ctx = Context::from_waker(&waker);
    let _ = fut.poll_unpin(&mut ctx);
}
