// crates/framebot-streams/src/worker.rs
//
// threaded_worker(name): decouple upstream and downstream with a bounded
// SPSC queue serviced by a dedicated worker thread. Terminal signals travel
// through the queue in-band, so they are observed after the last element.
// Backpressure is the queue itself: a full queue blocks the producer, and
// upstream demand is only replenished after a successful enqueue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::{Publisher, StreamError, Subscriber, Subscription, SubscriptionBackend};

const QUEUE_CAPACITY: usize = 16;
const SEND_POLL: Duration = Duration::from_millis(50);

enum Signal<T> {
    Next(T),
    Complete,
    Error(StreamError),
}

pub struct ThreadedWorker<P> {
    upstream: P,
    name: String,
}

impl<P> ThreadedWorker<P> {
    pub(crate) fn new(upstream: P, name: &str) -> Self {
        Self { upstream, name: name.to_string() }
    }
}

impl<P, T> Publisher<T> for ThreadedWorker<P>
where
    T: Send + 'static,
    P: Publisher<T> + 'static,
{
    fn subscribe(self: Box<Self>, subscriber: Box<dyn Subscriber<T>>) {
        let ThreadedWorker { upstream, name } = *self;
        let (tx, rx) = bounded::<Signal<T>>(QUEUE_CAPACITY);
        let shared = Arc::new(WorkerShared {
            demand: Mutex::new(DemandState { demand: 0, cancelled: false }),
            wakeup: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });

        let consumer_shared = shared.clone();
        let spawned = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || consumer_loop(rx, subscriber, consumer_shared));
        if let Err(e) = spawned {
            warn!(worker = %name, "failed to spawn worker thread: {e}");
            return;
        }

        Box::new(upstream).subscribe(Box::new(Producer {
            tx: Some(tx),
            shared,
            upstream: None,
            terminated: false,
        }));
    }
}

struct WorkerShared {
    demand: Mutex<DemandState>,
    wakeup: Condvar,
    /// Mirror of DemandState.cancelled readable without the lock, for the
    /// producer's enqueue loop.
    cancelled: AtomicBool,
}

struct DemandState {
    demand: u64,
    cancelled: bool,
}

impl SubscriptionBackend for WorkerShared {
    fn request(&self, n: u64) {
        let mut state = self.demand.lock();
        state.demand = state.demand.saturating_add(n);
        self.wakeup.notify_one();
    }

    fn cancel(&self) {
        let mut state = self.demand.lock();
        state.cancelled = true;
        self.cancelled.store(true, Ordering::Relaxed);
        self.wakeup.notify_one();
    }
}

fn consumer_loop<T: Send + 'static>(
    rx: Receiver<Signal<T>>,
    mut downstream: Box<dyn Subscriber<T>>,
    shared: Arc<WorkerShared>,
) {
    downstream.on_subscribe(Subscription::new(&shared));
    loop {
        let signal = match rx.recv() {
            Ok(signal) => signal,
            // Producer dropped without a terminal: the upstream was torn
            // down (cancel); nothing further to deliver.
            Err(_) => return,
        };
        match signal {
            Signal::Next(element) => {
                {
                    let mut state = shared.demand.lock();
                    while state.demand == 0 && !state.cancelled {
                        shared.wakeup.wait(&mut state);
                    }
                    if state.cancelled {
                        return;
                    }
                    state.demand -= 1;
                }
                downstream.on_next(element);
            }
            Signal::Complete => {
                downstream.on_complete();
                return;
            }
            Signal::Error(error) => {
                downstream.on_error(error);
                return;
            }
        }
    }
}

/// Upstream half: enqueues on the caller's thread.
struct Producer<T> {
    tx: Option<Sender<Signal<T>>>,
    shared: Arc<WorkerShared>,
    upstream: Option<Subscription>,
    terminated: bool,
}

impl<T: Send + 'static> Producer<T> {
    /// Blocking enqueue that stays responsive to a downstream cancel.
    /// Returns false once the worker is gone or cancelled.
    fn enqueue(&mut self, signal: Signal<T>) -> bool {
        let Some(tx) = self.tx.as_ref() else { return false };
        let mut signal = signal;
        loop {
            if self.shared.cancelled.load(Ordering::Relaxed) {
                return false;
            }
            match tx.send_timeout(signal, SEND_POLL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(unsent)) => signal = unsent,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    fn teardown(&mut self) {
        self.tx = None;
        if let Some(upstream) = self.upstream.take() {
            upstream.cancel();
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for Producer<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        subscription.request(QUEUE_CAPACITY as u64);
        self.upstream = Some(subscription);
    }

    fn on_next(&mut self, element: T) {
        if self.terminated {
            return;
        }
        if self.enqueue(Signal::Next(element)) {
            if let Some(upstream) = &self.upstream {
                upstream.request(1);
            }
        } else {
            self.terminated = true;
            self.teardown();
        }
    }

    fn on_complete(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.enqueue(Signal::Complete);
        self.tx = None;
    }

    fn on_error(&mut self, error: StreamError) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.enqueue(Signal::Error(error));
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use crate::publishers;
    use crate::test_support::Probe;
    use crate::PublisherExt;

    #[test]
    fn preserves_order_across_the_thread_boundary() {
        let elements: Vec<u32> = (0..100).collect();
        let probe = Probe::subscribed_with_demand(
            publishers::of(elements.clone()).threaded_worker("order-test"),
            1000,
        );
        assert!(probe.wait_until(|s| s.completed));
        assert_eq!(probe.elements(), elements);
    }

    #[test]
    fn terminal_arrives_after_last_element() {
        let probe = Probe::subscribed_with_demand(
            publishers::of(vec![1, 2, 3]).threaded_worker("term-test"),
            10,
        );
        assert!(probe.wait_until(|s| s.completed));
        assert_eq!(probe.elements(), vec![1, 2, 3]);
    }

    #[test]
    fn withholds_elements_without_demand() {
        let probe = Probe::subscribed_with_demand(
            publishers::of(vec![1, 2, 3]).threaded_worker("demand-test"),
            1,
        );
        assert!(probe.wait_until(|s| s.elements.len() == 1));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(probe.element_count(), 1);
        probe.request(5);
        assert!(probe.wait_until(|s| s.completed));
        assert_eq!(probe.elements(), vec![1, 2, 3]);
    }

    #[test]
    fn cancel_stops_the_worker() {
        let elements: Vec<u32> = (0..10_000).collect();
        let probe = Probe::subscribed_with_demand(
            publishers::of(elements).threaded_worker("cancel-test"),
            5,
        );
        assert!(probe.wait_until(|s| s.elements.len() == 5));
        probe.cancel();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(probe.element_count(), 5);
        assert!(!probe.completed());
    }
}
