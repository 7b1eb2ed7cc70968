// crates/framebot-streams/src/concat.rs
//
// concat(a, b): emit all of A, then on A's completion subscribe B and emit
// all of B. Demand requested but not yet satisfied when A completes is
// transferred to B. Errors from either stream pass through.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Publisher, StreamError, Subscriber, Subscription, SubscriptionBackend};

pub fn concat<T, A, B>(first: A, second: B) -> Concat<T>
where
    T: Send + 'static,
    A: Publisher<T> + 'static,
    B: Publisher<T> + 'static,
{
    Concat { first: Box::new(first), second: Box::new(second) }
}

pub struct Concat<T> {
    first: Box<dyn Publisher<T>>,
    second: Box<dyn Publisher<T>>,
}

impl<T: Send + 'static> Publisher<T> for Concat<T> {
    fn subscribe(self: Box<Self>, subscriber: Box<dyn Subscriber<T>>) {
        let Concat { first, second } = *self;
        let core = Arc::new(ConcatCore {
            ctrl: Mutex::new(Ctrl {
                outstanding: 0,
                upstream: None,
                gate_open: false,
                in_second: false,
                cancelled: false,
                terminated: false,
            }),
            downstream: Mutex::new(Some(subscriber)),
            second: Mutex::new(Some(second)),
        });
        Box::new(first).subscribe(Box::new(ForwardSubscriber { core }));
    }
}

struct ConcatCore<T> {
    ctrl: Mutex<Ctrl>,
    downstream: Mutex<Option<Box<dyn Subscriber<T>>>>,
    second: Mutex<Option<Box<dyn Publisher<T>>>>,
}

struct Ctrl {
    /// Demand requested downstream and not yet satisfied by either stream.
    outstanding: u64,
    upstream: Option<Subscription>,
    /// Closed while downstream's on_subscribe runs; requests made inside it
    /// are forwarded when the gate opens.
    gate_open: bool,
    in_second: bool,
    cancelled: bool,
    terminated: bool,
}

impl<T: Send + 'static> SubscriptionBackend for ConcatCore<T> {
    fn request(&self, n: u64) {
        let upstream = {
            let mut ctrl = self.ctrl.lock();
            if ctrl.cancelled || ctrl.terminated {
                return;
            }
            ctrl.outstanding = ctrl.outstanding.saturating_add(n);
            if !ctrl.gate_open {
                return;
            }
            ctrl.upstream.clone()
        };
        if let Some(upstream) = upstream {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        let upstream = {
            let mut ctrl = self.ctrl.lock();
            if ctrl.cancelled || ctrl.terminated {
                return;
            }
            ctrl.cancelled = true;
            ctrl.upstream.take()
        };
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

struct ForwardSubscriber<T> {
    core: Arc<ConcatCore<T>>,
}

impl<T: Send + 'static> Subscriber<T> for ForwardSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        let (first_stream, transferred) = {
            let mut ctrl = self.core.ctrl.lock();
            ctrl.upstream = Some(subscription.clone());
            (!ctrl.in_second, ctrl.outstanding)
        };
        if first_stream {
            let downstream_subscription = Subscription::new(&self.core);
            {
                let mut downstream = self.core.downstream.lock();
                if let Some(downstream) = downstream.as_mut() {
                    downstream.on_subscribe(downstream_subscription);
                }
            }
            let pending = {
                let mut ctrl = self.core.ctrl.lock();
                ctrl.gate_open = true;
                if ctrl.cancelled {
                    None
                } else {
                    Some(ctrl.outstanding)
                }
            };
            match pending {
                Some(n) if n > 0 => subscription.request(n),
                Some(_) => {}
                None => subscription.cancel(),
            }
        } else if transferred > 0 {
            subscription.request(transferred);
        }
    }

    fn on_next(&mut self, element: T) {
        {
            let mut ctrl = self.core.ctrl.lock();
            if ctrl.cancelled || ctrl.terminated {
                return;
            }
            ctrl.outstanding = ctrl.outstanding.saturating_sub(1);
        }
        if let Some(downstream) = self.core.downstream.lock().as_mut() {
            downstream.on_next(element);
        }
    }

    fn on_complete(&mut self) {
        let second = {
            let mut ctrl = self.core.ctrl.lock();
            if ctrl.cancelled || ctrl.terminated {
                return;
            }
            if ctrl.in_second {
                ctrl.terminated = true;
                None
            } else {
                ctrl.in_second = true;
                ctrl.upstream = None;
                Some(self.core.second.lock().take().expect("second stream consumed twice"))
            }
        };
        match second {
            Some(second) => {
                second.subscribe(Box::new(ForwardSubscriber { core: self.core.clone() }));
            }
            None => {
                if let Some(mut downstream) = self.core.downstream.lock().take() {
                    downstream.on_complete();
                }
            }
        }
    }

    fn on_error(&mut self, error: StreamError) {
        {
            let mut ctrl = self.core.ctrl.lock();
            if ctrl.cancelled || ctrl.terminated {
                return;
            }
            ctrl.terminated = true;
        }
        if let Some(mut downstream) = self.core.downstream.lock().take() {
            downstream.on_error(error);
        }
    }
}
