// crates/framebot-streams/src/map.rs
//
// map(f): apply a closure per element, forward terminals unchanged. Demand
// is one-to-one, so the upstream subscription is handed straight through.

use crate::{Publisher, StreamError, Subscriber, Subscription};

pub struct Map<P, F, T> {
    upstream: P,
    f: F,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<P, F, T> Map<P, F, T> {
    pub(crate) fn new(upstream: P, f: F) -> Self {
        Self { upstream, f, _marker: std::marker::PhantomData }
    }
}

impl<P, F, T, U> Publisher<U> for Map<P, F, T>
where
    T: Send + 'static,
    U: Send + 'static,
    P: Publisher<T> + 'static,
    F: FnMut(T) -> U + Send + 'static,
{
    fn subscribe(self: Box<Self>, subscriber: Box<dyn Subscriber<U>>) {
        let Map { upstream, f, .. } = *self;
        Box::new(upstream).subscribe(Box::new(MapSubscriber {
            f,
            downstream: subscriber,
            terminated: false,
        }));
    }
}

struct MapSubscriber<F, U> {
    f: F,
    downstream: Box<dyn Subscriber<U>>,
    terminated: bool,
}

impl<F, T, U> Subscriber<T> for MapSubscriber<F, U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> U + Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, element: T) {
        if self.terminated {
            return;
        }
        let mapped = (self.f)(element);
        self.downstream.on_next(mapped);
    }

    fn on_complete(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.downstream.on_complete();
    }

    fn on_error(&mut self, error: StreamError) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.downstream.on_error(error);
    }
}
