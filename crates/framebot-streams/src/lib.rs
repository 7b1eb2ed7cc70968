// crates/framebot-streams/src/lib.rs
//
// Lazy, demand-driven publisher/subscriber runtime. A publisher produces
// nothing until a subscriber is attached and requests demand; elements move
// by value from operator to operator. threaded_worker is the only operator
// that crosses a thread boundary.
//
// Runtime contract (enforced by every operator in this crate):
//   - exactly one on_subscribe, then zero or more on_next, then at most one
//     of on_complete / on_error;
//   - a subscriber never receives more elements than its outstanding demand;
//   - cancel() is idempotent and a no-op after a terminal signal;
//   - a publisher is consumed by subscribe() and cannot be re-subscribed.
//
// Element-producing publishers (generators::stateful, publishers::of) drain
// demand through a trampoline: request() issued from inside on_next adds to
// the demand counter and returns, and the active drain loop picks it up.
// Operators therefore never see a reentrant on_next on the same chain.

use std::sync::{Arc, Weak};

use thiserror::Error;

pub mod breaker;
pub mod concat;
pub mod flatten;
pub mod generators;
pub mod map;
pub mod publishers;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use concat::concat;

/// Terminal failure carried by `on_error`.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("subscription: {0}")]
    Subscription(String),
    #[error("{0}")]
    Other(String),
}

/// Receiving half of a stream. `on_subscribe` is delivered exactly once,
/// before any element.
pub trait Subscriber<T>: Send {
    fn on_subscribe(&mut self, subscription: Subscription);
    fn on_next(&mut self, element: T);
    fn on_complete(&mut self);
    fn on_error(&mut self, error: StreamError);
}

/// Producing half of a stream. `subscribe` consumes the publisher.
pub trait Publisher<T: Send + 'static>: Send {
    fn subscribe(self: Box<Self>, subscriber: Box<dyn Subscriber<T>>);
}

impl<T: Send + 'static> Publisher<T> for Box<dyn Publisher<T>> {
    fn subscribe(self: Box<Self>, subscriber: Box<dyn Subscriber<T>>) {
        (*self).subscribe(subscriber)
    }
}

/// Boxed publisher, the element type of streams consumed by `flatten`.
pub type BoxPublisher<T> = Box<dyn Publisher<T>>;

/// Demand/cancellation endpoint implemented by each operator.
pub(crate) trait SubscriptionBackend: Send + Sync {
    fn request(&self, n: u64);
    fn cancel(&self);
}

/// Handle from a subscriber back to its publisher. Holds the publisher's
/// state weakly: a subscription never extends the publisher's life, and
/// calls after the publisher is gone are no-ops.
#[derive(Clone)]
pub struct Subscription {
    backend: Weak<dyn SubscriptionBackend>,
}

impl Subscription {
    pub(crate) fn new(backend: &Arc<impl SubscriptionBackend + 'static>) -> Self {
        let backend: Arc<dyn SubscriptionBackend> = backend.clone();
        let weak: Weak<dyn SubscriptionBackend> = Arc::downgrade(&backend);
        Self { backend: weak }
    }

    /// A subscription with no publisher behind it; request/cancel are no-ops.
    pub fn detached() -> Self {
        struct Noop;
        impl SubscriptionBackend for Noop {
            fn request(&self, _n: u64) {}
            fn cancel(&self) {}
        }
        let weak: Weak<dyn SubscriptionBackend> = Weak::<Noop>::new();
        Self { backend: weak }
    }

    /// Add `n` to the outstanding demand.
    pub fn request(&self, n: u64) {
        if let Some(backend) = self.backend.upgrade() {
            backend.request(n);
        }
    }

    /// Stop the upstream promptly. Idempotent.
    pub fn cancel(&self) {
        if let Some(backend) = self.backend.upgrade() {
            backend.cancel();
        }
    }
}

/// Chaining adapters over any publisher.
pub trait PublisherExt<T: Send + 'static>: Publisher<T> + Sized + 'static {
    /// Apply `f` to every element. Completion and errors pass through.
    fn map<U, F>(self, f: F) -> map::Map<Self, F, T>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        map::Map::new(self, f)
    }

    /// Turn a stream of publishers into a stream of their elements. At most
    /// one inner publisher is subscribed at a time.
    fn flatten<U>(self) -> flatten::Flatten<Self, U>
    where
        U: Send + 'static,
        Self: Publisher<BoxPublisher<U>>,
    {
        flatten::Flatten::new(self)
    }

    /// Hand elements to a dedicated worker thread through a bounded queue.
    /// A full queue withholds upstream demand.
    fn threaded_worker(self, name: &str) -> worker::ThreadedWorker<Self> {
        worker::ThreadedWorker::new(self, name)
    }

    /// Complete the downstream and cancel the upstream on the first of the
    /// given process signals.
    fn signal_breaker(self, signals: &[i32]) -> breaker::SignalBreaker<Self> {
        breaker::SignalBreaker::new(self, signals)
    }
}

impl<P, T> PublisherExt<T> for P
where
    T: Send + 'static,
    P: Publisher<T> + Sized + 'static,
{
}
