// crates/framebot-streams/src/breaker.rs
//
// signal_breaker(signals): pass elements through untouched; on the first of
// the given process signals, cancel the upstream and complete the
// downstream. The signal handlers are released once the stream ends.

use std::sync::Arc;

use parking_lot::Mutex;
use signal_hook::iterator::{Handle, Signals};
use tracing::info;

use crate::{Publisher, StreamError, Subscriber, Subscription, SubscriptionBackend};

pub struct SignalBreaker<P> {
    upstream: P,
    signals: Vec<i32>,
}

impl<P> SignalBreaker<P> {
    pub(crate) fn new(upstream: P, signals: &[i32]) -> Self {
        Self { upstream, signals: signals.to_vec() }
    }
}

impl<P, T> Publisher<T> for SignalBreaker<P>
where
    T: Send + 'static,
    P: Publisher<T> + 'static,
{
    fn subscribe(self: Box<Self>, subscriber: Box<dyn Subscriber<T>>) {
        let SignalBreaker { upstream, signals } = *self;

        let core = Arc::new(BreakerCore {
            ctrl: Mutex::new(Ctrl {
                upstream: None,
                handle: None,
                gate_open: false,
                pending: 0,
                terminated: false,
            }),
            downstream: Mutex::new(Some(subscriber)),
        });

        let mut listener = match Signals::new(&signals) {
            Ok(listener) => listener,
            Err(e) => {
                let mut downstream = core.downstream.lock().take().unwrap();
                downstream.on_subscribe(Subscription::detached());
                downstream.on_error(StreamError::Other(format!(
                    "installing signal handlers: {e}"
                )));
                return;
            }
        };
        core.ctrl.lock().handle = Some(listener.handle());

        let watcher_core = core.clone();
        std::thread::Builder::new()
            .name("signal-breaker".into())
            .spawn(move || {
                if let Some(signal) = listener.forever().next() {
                    info!(signal, "stopping stream on process signal");
                    watcher_core.trip();
                }
            })
            .ok();

        Box::new(upstream).subscribe(Box::new(BreakerSubscriber { core }));
    }
}

struct BreakerCore<T> {
    ctrl: Mutex<Ctrl>,
    downstream: Mutex<Option<Box<dyn Subscriber<T>>>>,
}

struct Ctrl {
    upstream: Option<Subscription>,
    handle: Option<Handle>,
    gate_open: bool,
    /// Demand requested while the gate was closed, forwarded when it opens.
    pending: u64,
    terminated: bool,
}

impl<T: Send + 'static> BreakerCore<T> {
    /// First signal observed: cancel upstream, complete downstream.
    fn trip(&self) {
        let upstream = {
            let mut ctrl = self.ctrl.lock();
            if ctrl.terminated {
                return;
            }
            ctrl.terminated = true;
            if let Some(handle) = ctrl.handle.take() {
                handle.close();
            }
            ctrl.upstream.take()
        };
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
        if let Some(mut downstream) = self.downstream.lock().take() {
            downstream.on_complete();
        }
    }

    /// Terminal from upstream: release the signal handlers, forward.
    fn finish(&self, error: Option<StreamError>) {
        {
            let mut ctrl = self.ctrl.lock();
            if ctrl.terminated {
                return;
            }
            ctrl.terminated = true;
            ctrl.upstream = None;
            if let Some(handle) = ctrl.handle.take() {
                handle.close();
            }
        }
        if let Some(mut downstream) = self.downstream.lock().take() {
            match error {
                Some(error) => downstream.on_error(error),
                None => downstream.on_complete(),
            }
        }
    }
}

impl<T: Send + 'static> SubscriptionBackend for BreakerCore<T> {
    fn request(&self, n: u64) {
        let upstream = {
            let mut ctrl = self.ctrl.lock();
            if ctrl.terminated {
                return;
            }
            if !ctrl.gate_open {
                ctrl.pending = ctrl.pending.saturating_add(n);
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
            if ctrl.terminated {
                return;
            }
            ctrl.terminated = true;
            if let Some(handle) = ctrl.handle.take() {
                handle.close();
            }
            ctrl.upstream.take()
        };
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

struct BreakerSubscriber<T> {
    core: Arc<BreakerCore<T>>,
}

impl<T: Send + 'static> Subscriber<T> for BreakerSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.core.ctrl.lock().upstream = Some(subscription.clone());
        let downstream_subscription = Subscription::new(&self.core);
        {
            let mut downstream = self.core.downstream.lock();
            if let Some(downstream) = downstream.as_mut() {
                downstream.on_subscribe(downstream_subscription);
            }
        }
        let forward = {
            let mut ctrl = self.core.ctrl.lock();
            ctrl.gate_open = true;
            if ctrl.terminated {
                None
            } else {
                Some(std::mem::take(&mut ctrl.pending))
            }
        };
        match forward {
            Some(n) if n > 0 => subscription.request(n),
            Some(_) => {}
            None => subscription.cancel(),
        }
    }

    fn on_next(&mut self, element: T) {
        if self.core.ctrl.lock().terminated {
            return;
        }
        if let Some(downstream) = self.core.downstream.lock().as_mut() {
            downstream.on_next(element);
        }
    }

    fn on_complete(&mut self) {
        self.core.finish(None);
    }

    fn on_error(&mut self, error: StreamError) {
        self.core.finish(Some(error));
    }
}
