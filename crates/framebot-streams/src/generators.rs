// crates/framebot-streams/src/generators.rs
//
// generators::stateful(init, pump): a demand-driven source. `init` runs on
// the first unit of demand; `pump` is then called once per needed element
// and may emit through the sink, return empty-handed to be polled again, or
// complete the stream.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Publisher, Subscriber, Subscription, SubscriptionBackend};

/// Emission surface handed to the pump on every call.
pub struct GeneratorSink<T> {
    items: Vec<T>,
    completed: bool,
    failed: Option<crate::StreamError>,
}

impl<T> GeneratorSink<T> {
    fn new() -> Self {
        Self { items: Vec::new(), completed: false, failed: None }
    }

    pub fn on_next(&mut self, element: T) {
        self.items.push(element);
    }

    pub fn on_complete(&mut self) {
        self.completed = true;
    }

    /// Fail the stream. Pending elements are discarded; the error is the
    /// terminal signal.
    pub fn on_error(&mut self, error: crate::StreamError) {
        self.failed = Some(error);
    }
}

pub fn stateful<T, S, I, P>(init: I, pump: P) -> Stateful<T, S, I, P>
where
    T: Send + 'static,
    S: Send + 'static,
    I: FnOnce() -> S + Send + 'static,
    P: FnMut(&mut S, &mut GeneratorSink<T>) + Send + 'static,
{
    Stateful { init, pump, _marker: std::marker::PhantomData }
}

pub struct Stateful<T, S, I, P> {
    init: I,
    pump: P,
    _marker: std::marker::PhantomData<fn() -> (T, S)>,
}

impl<T, S, I, P> Publisher<T> for Stateful<T, S, I, P>
where
    T: Send + 'static,
    S: Send + 'static,
    I: FnOnce() -> S + Send + 'static,
    P: FnMut(&mut S, &mut GeneratorSink<T>) + Send + 'static,
{
    fn subscribe(self: Box<Self>, subscriber: Box<dyn Subscriber<T>>) {
        let Stateful { init, pump, .. } = *self;
        let core = Arc::new(StatefulCore {
            ctrl: Mutex::new(Ctrl {
                demand: 0,
                pending: VecDeque::new(),
                draining: false,
                cancelled: false,
                completed: false,
                failed: None,
                terminated: false,
            }),
            work: Mutex::new(Work { init: Some(init), state: None, pump }),
            downstream: Mutex::new(Some(subscriber)),
            keep_alive: Mutex::new(None),
        });
        // The stream owns itself while live; the self-reference is released
        // on the terminal signal or on cancel.
        *core.keep_alive.lock() = Some(core.clone());

        // Keep the drain gated while on_subscribe runs: demand requested from
        // inside it accumulates and is drained below, once the downstream
        // lock is released again.
        core.ctrl.lock().draining = true;
        let subscription = Subscription::new(&core);
        {
            let mut downstream = core.downstream.lock();
            if let Some(downstream) = downstream.as_mut() {
                downstream.on_subscribe(subscription);
            }
        }
        core.drain();
    }
}

struct StatefulCore<T, S, I, P> {
    ctrl: Mutex<Ctrl<T>>,
    work: Mutex<Work<S, I, P>>,
    downstream: Mutex<Option<Box<dyn Subscriber<T>>>>,
    keep_alive: Mutex<Option<Arc<Self>>>,
}

struct Ctrl<T> {
    demand: u64,
    /// Emitted by the pump but not yet covered by demand.
    pending: VecDeque<T>,
    draining: bool,
    cancelled: bool,
    /// Pump called on_complete; terminal still owed downstream.
    completed: bool,
    /// Pump called on_error; terminal still owed downstream.
    failed: Option<crate::StreamError>,
    terminated: bool,
}

struct Work<S, I, P> {
    init: Option<I>,
    state: Option<S>,
    pump: P,
}

enum Step<T> {
    Deliver(T),
    Terminal(Option<crate::StreamError>),
    Pump,
    Idle,
}

impl<T, S, I, P> StatefulCore<T, S, I, P>
where
    T: Send + 'static,
    S: Send + 'static,
    I: FnOnce() -> S + Send + 'static,
    P: FnMut(&mut S, &mut GeneratorSink<T>) + Send + 'static,
{
    fn drain(&self) {
        loop {
            let step = {
                let mut ctrl = self.ctrl.lock();
                if ctrl.cancelled || ctrl.terminated {
                    ctrl.draining = false;
                    Step::Idle
                } else if ctrl.failed.is_some() {
                    ctrl.terminated = true;
                    ctrl.pending.clear();
                    Step::Terminal(ctrl.failed.take())
                } else if ctrl.demand > 0 && !ctrl.pending.is_empty() {
                    ctrl.demand -= 1;
                    Step::Deliver(ctrl.pending.pop_front().unwrap())
                } else if ctrl.completed && ctrl.pending.is_empty() {
                    ctrl.terminated = true;
                    Step::Terminal(None)
                } else if ctrl.demand > 0 && !ctrl.completed {
                    Step::Pump
                } else {
                    ctrl.draining = false;
                    Step::Idle
                }
            };

            match step {
                Step::Idle => return,
                Step::Deliver(element) => {
                    if let Some(downstream) = self.downstream.lock().as_mut() {
                        downstream.on_next(element);
                    }
                }
                Step::Terminal(error) => {
                    if let Some(mut downstream) = self.downstream.lock().take() {
                        match error {
                            Some(error) => downstream.on_error(error),
                            None => downstream.on_complete(),
                        }
                    }
                    self.ctrl.lock().draining = false;
                    *self.keep_alive.lock() = None;
                    return;
                }
                Step::Pump => {
                    let mut sink = GeneratorSink::new();
                    {
                        let work = &mut *self.work.lock();
                        if work.state.is_none() {
                            let init = work.init.take().expect("generator init ran twice");
                            work.state = Some(init());
                        }
                        let state = work.state.as_mut().unwrap();
                        (work.pump)(state, &mut sink);
                    }
                    let mut ctrl = self.ctrl.lock();
                    ctrl.pending.extend(sink.items);
                    if sink.completed {
                        ctrl.completed = true;
                    }
                    if sink.failed.is_some() {
                        ctrl.failed = sink.failed;
                    }
                }
            }
        }
    }
}

impl<T, S, I, P> SubscriptionBackend for StatefulCore<T, S, I, P>
where
    T: Send + 'static,
    S: Send + 'static,
    I: FnOnce() -> S + Send + 'static,
    P: FnMut(&mut S, &mut GeneratorSink<T>) + Send + 'static,
{
    fn request(&self, n: u64) {
        {
            let mut ctrl = self.ctrl.lock();
            if ctrl.cancelled || ctrl.terminated {
                return;
            }
            ctrl.demand = ctrl.demand.saturating_add(n);
            if ctrl.draining {
                return;
            }
            ctrl.draining = true;
        }
        self.drain();
    }

    fn cancel(&self) {
        {
            let mut ctrl = self.ctrl.lock();
            if ctrl.cancelled || ctrl.terminated {
                return;
            }
            ctrl.cancelled = true;
            ctrl.pending.clear();
        }
        *self.keep_alive.lock() = None;
    }
}
