// crates/framebot-streams/src/flatten.rs
//
// flatten(): subscribe to a stream of publishers and emit their elements in
// sequence. At most one inner subscription is active; the next inner
// publisher is requested from the outer stream only when there is unmet
// downstream demand. Inner error fails the whole stream; the stream
// completes when the outer has completed and the last inner has drained.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{BoxPublisher, Publisher, StreamError, Subscriber, Subscription, SubscriptionBackend};

pub struct Flatten<P, T> {
    upstream: P,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<P, T> Flatten<P, T> {
    pub(crate) fn new(upstream: P) -> Self {
        Self { upstream, _marker: std::marker::PhantomData }
    }
}

impl<P, T> Publisher<T> for Flatten<P, T>
where
    T: Send + 'static,
    P: Publisher<BoxPublisher<T>> + 'static,
{
    fn subscribe(self: Box<Self>, subscriber: Box<dyn Subscriber<T>>) {
        let Flatten { upstream, .. } = *self;
        let core = Arc::new(FlattenCore {
            ctrl: Mutex::new(Ctrl {
                demand: 0,
                outer: None,
                inner: None,
                gate_open: false,
                awaiting_inner: false,
                inner_active: false,
                outer_done: false,
                cancelled: false,
                terminated: false,
            }),
            downstream: Mutex::new(Some(subscriber)),
        });
        Box::new(upstream).subscribe(Box::new(OuterSubscriber { core }));
    }
}

struct FlattenCore<T> {
    ctrl: Mutex<Ctrl>,
    downstream: Mutex<Option<Box<dyn Subscriber<T>>>>,
}

struct Ctrl {
    demand: u64,
    outer: Option<Subscription>,
    inner: Option<Subscription>,
    gate_open: bool,
    /// An inner publisher has been requested from the outer stream and has
    /// not yet arrived.
    awaiting_inner: bool,
    inner_active: bool,
    outer_done: bool,
    cancelled: bool,
    terminated: bool,
}

impl Ctrl {
    fn live(&self) -> bool {
        !self.cancelled && !self.terminated
    }
}

impl<T: Send + 'static> FlattenCore<T> {
    /// With demand present and no inner active, pull the next inner
    /// publisher from the outer stream.
    fn pull_next_inner(&self) {
        let outer = {
            let mut ctrl = self.ctrl.lock();
            if !ctrl.live() || ctrl.inner_active || ctrl.awaiting_inner || ctrl.outer_done {
                return;
            }
            if ctrl.demand == 0 {
                return;
            }
            ctrl.awaiting_inner = true;
            ctrl.outer.clone()
        };
        if let Some(outer) = outer {
            outer.request(1);
        }
    }

    fn complete_downstream(&self) {
        if let Some(mut downstream) = self.downstream.lock().take() {
            downstream.on_complete();
        }
    }

    fn fail_downstream(&self, error: StreamError) {
        if let Some(mut downstream) = self.downstream.lock().take() {
            downstream.on_error(error);
        }
    }
}

impl<T: Send + 'static> SubscriptionBackend for FlattenCore<T> {
    fn request(&self, n: u64) {
        let inner = {
            let mut ctrl = self.ctrl.lock();
            if !ctrl.live() {
                return;
            }
            ctrl.demand = ctrl.demand.saturating_add(n);
            if !ctrl.gate_open {
                return;
            }
            if ctrl.inner_active {
                ctrl.inner.clone()
            } else {
                None
            }
        };
        match inner {
            Some(inner) => inner.request(n),
            None => self.pull_next_inner(),
        }
    }

    fn cancel(&self) {
        let (outer, inner) = {
            let mut ctrl = self.ctrl.lock();
            if !ctrl.live() {
                return;
            }
            ctrl.cancelled = true;
            (ctrl.outer.take(), ctrl.inner.take())
        };
        if let Some(inner) = inner {
            inner.cancel();
        }
        if let Some(outer) = outer {
            outer.cancel();
        }
    }
}

struct OuterSubscriber<T> {
    core: Arc<FlattenCore<T>>,
}

impl<T: Send + 'static> Subscriber<BoxPublisher<T>> for OuterSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.core.ctrl.lock().outer = Some(subscription);
        let downstream_subscription = Subscription::new(&self.core);
        {
            let mut downstream = self.core.downstream.lock();
            if let Some(downstream) = downstream.as_mut() {
                downstream.on_subscribe(downstream_subscription);
            }
        }
        let cancelled = {
            let mut ctrl = self.core.ctrl.lock();
            ctrl.gate_open = true;
            ctrl.cancelled
        };
        if !cancelled {
            self.core.pull_next_inner();
        }
    }

    fn on_next(&mut self, inner: BoxPublisher<T>) {
        {
            let mut ctrl = self.core.ctrl.lock();
            if !ctrl.live() {
                return;
            }
            ctrl.awaiting_inner = false;
            ctrl.inner_active = true;
        }
        inner.subscribe(Box::new(InnerSubscriber { core: self.core.clone() }));
    }

    fn on_complete(&mut self) {
        let finish = {
            let mut ctrl = self.core.ctrl.lock();
            if !ctrl.live() {
                return;
            }
            ctrl.outer_done = true;
            if !ctrl.inner_active {
                ctrl.terminated = true;
                true
            } else {
                false
            }
        };
        if finish {
            self.core.complete_downstream();
        }
    }

    fn on_error(&mut self, error: StreamError) {
        let inner = {
            let mut ctrl = self.core.ctrl.lock();
            if !ctrl.live() {
                return;
            }
            ctrl.terminated = true;
            ctrl.inner.take()
        };
        if let Some(inner) = inner {
            inner.cancel();
        }
        self.core.fail_downstream(error);
    }
}

struct InnerSubscriber<T> {
    core: Arc<FlattenCore<T>>,
}

impl<T: Send + 'static> Subscriber<T> for InnerSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        let demand = {
            let mut ctrl = self.core.ctrl.lock();
            if !ctrl.live() {
                subscription.cancel();
                return;
            }
            ctrl.inner = Some(subscription.clone());
            ctrl.demand
        };
        if demand > 0 {
            subscription.request(demand);
        }
    }

    fn on_next(&mut self, element: T) {
        {
            let mut ctrl = self.core.ctrl.lock();
            if !ctrl.live() {
                return;
            }
            ctrl.demand = ctrl.demand.saturating_sub(1);
        }
        if let Some(downstream) = self.core.downstream.lock().as_mut() {
            downstream.on_next(element);
        }
    }

    fn on_complete(&mut self) {
        let finish = {
            let mut ctrl = self.core.ctrl.lock();
            if !ctrl.live() {
                return;
            }
            ctrl.inner = None;
            ctrl.inner_active = false;
            if ctrl.outer_done {
                ctrl.terminated = true;
                true
            } else {
                false
            }
        };
        if finish {
            self.core.complete_downstream();
        } else {
            self.core.pull_next_inner();
        }
    }

    fn on_error(&mut self, error: StreamError) {
        let outer = {
            let mut ctrl = self.core.ctrl.lock();
            if !ctrl.live() {
                return;
            }
            ctrl.terminated = true;
            ctrl.inner = None;
            ctrl.outer.take()
        };
        if let Some(outer) = outer {
            outer.cancel();
        }
        self.core.fail_downstream(error);
    }
}

#[cfg(test)]
mod tests {
    use crate::publishers;
    use crate::test_support::Probe;
    use crate::{BoxPublisher, PublisherExt, StreamError};

    #[test]
    fn flattens_in_sequence() {
        let probe = Probe::subscribed(
            publishers::of(vec![vec![1, 2], vec![], vec![3]])
                .map(|chunk| Box::new(publishers::of(chunk)) as BoxPublisher<i32>)
                .flatten(),
        );
        probe.request(10);
        assert_eq!(probe.elements(), vec![1, 2, 3]);
        assert!(probe.completed());
    }

    #[test]
    fn demand_is_honored_across_inner_streams() {
        let probe = Probe::subscribed(
            publishers::of(vec![vec![1, 2], vec![3, 4]])
                .map(|chunk| Box::new(publishers::of(chunk)) as BoxPublisher<i32>)
                .flatten(),
        );
        probe.request(3);
        assert_eq!(probe.elements(), vec![1, 2, 3]);
        assert!(!probe.completed());
        probe.request(2);
        assert_eq!(probe.elements(), vec![1, 2, 3, 4]);
        assert!(probe.completed());
    }

    #[test]
    fn inner_error_fails_the_stream() {
        let probe = Probe::subscribed(
            publishers::of(vec![0, 1])
                .map(|n| {
                    if n == 0 {
                        Box::new(publishers::error::<i32>(StreamError::Other("inner".into())))
                            as BoxPublisher<i32>
                    } else {
                        Box::new(publishers::of(vec![n])) as BoxPublisher<i32>
                    }
                })
                .flatten(),
        );
        probe.request(5);
        assert_eq!(probe.error().as_deref(), Some("inner"));
        assert_eq!(probe.element_count(), 0);
    }
}
