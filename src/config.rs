use std::{
    future::Future,
    num::NonZeroUsize,
    task::{Context, Poll},
    time::Duration,
};

use futures::future::{self, Either, FutureExt};
use futures_timer::Delay;

/// Rules shared by every loader of a request scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderConfig {
    /// How long a batch keeps accepting keys after its first placeholder is
    /// polled. `None` closes the window as soon as a poll observes that no
    /// key was added since the previous poll, which batches everything
    /// requested in one resolution pass without any timer.
    pub window: Option<Duration>,

    /// If set, a batch is dispatched immediately once it holds this many
    /// distinct keys, regardless of the window. Must be at least 2.
    pub max_batch_size: Option<NonZeroUsize>,

    /// Deadline for a single batched fetch.
    pub flush_timeout: Option<Duration>,
}

impl LoaderConfig {
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        if max < 2 {
            panic!("Max batch size for a loader must be at least 2");
        }
        self.max_batch_size = NonZeroUsize::new(max);
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = Some(timeout);
        self
    }

    pub(crate) fn open_window(&self) -> Window {
        match self.window {
            Some(duration) => Window::Unstarted(duration),
            None => Window::Quiescent { seen: 0 },
        }
    }
}

/// The accumulation window of one batch.
#[derive(Debug)]
pub(crate) enum Window {
    /// A timed window whose timer starts on the first poll.
    Unstarted(Duration),
    Timed(Delay),

    /// Closes once a poll sees the same number of enqueued keys as the
    /// previous poll did.
    Quiescent { seen: usize },

    Closed,
}

impl Window {
    /// Poll the window, given the number of loads that have joined the batch
    /// so far.
    pub(crate) fn poll_closed(&mut self, ctx: &mut Context<'_>, enqueued: usize) -> Poll<()> {
        match self {
            Window::Closed => Poll::Ready(()),
            Window::Unstarted(duration) => {
                let mut delay = Delay::new(*duration);
                let poll = delay.poll_unpin(ctx);
                *self = Window::Timed(delay);
                poll
            }
            Window::Timed(delay) => delay.poll_unpin(ctx),
            Window::Quiescent { seen } if *seen == enqueued => Poll::Ready(()),
            Window::Quiescent { seen } => {
                *seen = enqueued;
                // Yield to let sibling resolutions enqueue their keys, then
                // come straight back.
                ctx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

/// Bound `fetch` by `timeout`, if there is one. Returns the timeout that
/// expired on failure.
pub(crate) async fn with_deadline<F, T>(fetch: F, timeout: Option<Duration>) -> Result<T, Duration>
where
    F: Future<Output = T> + Unpin,
{
    match timeout {
        None => Ok(fetch.await),
        Some(timeout) => match future::select(fetch, Delay::new(timeout)).await {
            Either::Left((value, _deadline)) => Ok(value),
            Either::Right(..) => Err(timeout),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cooked_waker::{IntoWaker, Wake, WakeRef};

    #[derive(Debug, Clone, Copy, Default, IntoWaker)]
    struct NoOpWaker;

    impl WakeRef for NoOpWaker {
        fn wake_by_ref(&self) {}
    }

    impl Wake for NoOpWaker {}

    #[test]
    fn test_quiescent_window_waits_for_a_quiet_poll() {
        let waker = NoOpWaker.into_waker();
        let mut ctx = Context::from_waker(&waker);
        let mut window = LoaderConfig::default().open_window();

        assert_eq!(window.poll_closed(&mut ctx, 1), Poll::Pending);
        assert_eq!(window.poll_closed(&mut ctx, 3), Poll::Pending);
        assert_eq!(window.poll_closed(&mut ctx, 3), Poll::Ready(()));
    }

    #[test]
    #[should_panic]
    fn test_tiny_batch_size_rejected() {
        let _ = LoaderConfig::default().with_max_batch_size(1);
    }

    #[test]
    fn test_deadline_expires() {
        let result = futures::executor::block_on(with_deadline(
            future::pending::<()>(),
            Some(Duration::from_millis(5)),
        ));

        assert_eq!(result, Err(Duration::from_millis(5)));
    }
}
