//! Injected time source and task spawner.
//!
//! Every periodic task and every timeout in this crate goes through a
//! [`Clock`]/[`Spawner`] pair supplied at construction, so tests can swap
//! in a manually-advanced fake instead of sleeping in real time.

use std::time::Duration;

use futures::future::LocalBoxFuture;

/// Opaque monotonic timestamp. Only differences between two `Instant`s
/// are meaningful.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Instant(std::time::Instant);

impl Instant {
    /// Elapsed duration since an earlier instant. Saturates to zero if
    /// `earlier` is actually later (clock skew between fakes in tests).
    pub fn since(&self, earlier: Instant) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }
}

/// A source of monotonic time.
///
/// Implementations must be cheap to call repeatedly; this is invoked on
/// every admission check, timeout check, and dedup lookup.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Handle to a cancellable periodic task. Dropping it stops the timer,
/// matching "all timers must be cancellable at shutdown".
pub trait IntervalHandle {
    /// Cancels the timer. Equivalent to dropping the handle.
    fn cancel(self: Box<Self>);
}

/// A task spawner + timer source for a single logical node.
///
/// requires that a host running on a multi-threaded runtime
/// funnel all mutations through one actor per node; this crate enforces
/// that by never spawning anything that isn't `'static` + driven entirely
/// through this trait, so a host can implement it with a `LocalSet` and
/// guarantee everything spawned stays on one thread.
pub trait Spawner {
    /// Spawns a one-shot future. Not awaited by the caller.
    fn spawn(&self, fut: LocalBoxFuture<'static, ()>);

    /// Runs `f` every `period`, starting after the first `period` elapses.
    /// Returns a handle that cancels the timer when dropped.
    fn spawn_interval(
        &self,
        period: Duration,
        f: Box<dyn Fn()>,
    ) -> Box<dyn IntervalHandle>;

    /// A future that resolves after `dur`. Used for debounces (the 3s
    /// `Disconnected` debounce) and jittered scheduling (mesh-optimization
    /// jitter, isolation stagger).
    fn delay(&self, dur: Duration) -> LocalBoxFuture<'static, ()>;
}

#[cfg(feature = "tokio-runtime")]
pub mod tokio_impl {
    //! Default native `Clock`/`Spawner`, backed by `tokio`.
    //!
    //! `spawn`/`delay` collapse into a single trait impl for native hosts,
    //! using `tokio::task::spawn_local` under a `LocalSet`.

    use std::{rc::Rc, time::Duration};

    use futures::future::LocalBoxFuture;
    use tokio::task::JoinHandle;

    use super::{Clock, Instant, IntervalHandle, Spawner};

    /// `Clock` backed by `std::time::Instant`.
    #[derive(Clone, Copy, Default)]
    pub struct TokioClock;

    impl Clock for TokioClock {
        fn now(&self) -> Instant {
            Instant(std::time::Instant::now())
        }
    }

    /// `Spawner` backed by a `tokio::task::LocalSet`-compatible spawn.
    ///
    /// Uses `tokio::task::spawn_local`, so it must be driven from within a
    /// `LocalSet` — this is the mechanism that keeps a `Mesh`'s `Rc`-based
    /// state on a single thread even on tokio's multi-threaded runtime.
    #[derive(Clone, Copy, Default)]
    pub struct TokioSpawner;

    struct TokioIntervalHandle(JoinHandle<()>);

    impl IntervalHandle for TokioIntervalHandle {
        fn cancel(self: Box<Self>) {
            self.0.abort();
        }
    }

    impl Spawner for TokioSpawner {
        fn spawn(&self, fut: LocalBoxFuture<'static, ()>) {
            tokio::task::spawn_local(fut);
        }

        fn spawn_interval(
            &self,
            period: Duration,
            f: Box<dyn Fn()>,
        ) -> Box<dyn IntervalHandle> {
            let f = Rc::new(f);
            let handle = tokio::task::spawn_local(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(
                    tokio::time::MissedTickBehavior::Delay,
                );
                loop {
                    ticker.tick().await;
                    f();
                }
            });
            Box::new(TokioIntervalHandle(handle))
        }

        fn delay(&self, dur: Duration) -> LocalBoxFuture<'static, ()> {
            use futures::FutureExt;
            async move { tokio::time::sleep(dur).await }.boxed_local()
        }
    }
}

#[cfg(test)]
pub mod test_support {
    //! A manually-advanced `Clock` for deterministic tests. No `Spawner`
    //! fake is provided: scenario tests drive periodic behavior by calling
    //! the relevant `ConnectionManager`/`GossipManager`/`Dht` sweep methods
    //! directly rather than waiting on real timers.

    use std::{cell::Cell, time::Duration};

    use super::{Clock, Instant};

    pub struct TestClock {
        base: std::time::Instant,
        offset: Cell<Duration>,
    }

    impl TestClock {
        pub fn new() -> Self {
            Self { base: std::time::Instant::now(), offset: Cell::new(Duration::ZERO) }
        }

        pub fn advance(&self, by: Duration) {
            self.offset.set(self.offset.get() + by);
        }
    }

    impl Default for TestClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            Instant(self.base + self.offset.get())
        }
    }
}
