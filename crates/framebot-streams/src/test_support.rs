// crates/framebot-streams/src/test_support.rs
//
// Probe: a recording subscriber for operator tests. Elements and terminal
// signals land in shared state; demand is issued from the test body.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{Publisher, StreamError, Subscriber, Subscription};

pub(crate) struct ProbeState<T> {
    pub subscription: Option<Subscription>,
    pub elements: Vec<T>,
    pub completed: bool,
    pub error: Option<String>,
}

pub(crate) struct Probe<T> {
    state: Arc<Mutex<ProbeState<T>>>,
}

struct ProbeSubscriber<T> {
    state: Arc<Mutex<ProbeState<T>>>,
    initial_demand: u64,
}

impl<T: Send + 'static> Subscriber<T> for ProbeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.state.lock().subscription = Some(subscription.clone());
        if self.initial_demand > 0 {
            subscription.request(self.initial_demand);
        }
    }

    fn on_next(&mut self, element: T) {
        self.state.lock().elements.push(element);
    }

    fn on_complete(&mut self) {
        self.state.lock().completed = true;
    }

    fn on_error(&mut self, error: StreamError) {
        self.state.lock().error = Some(error.to_string());
    }
}

impl<T: Send + 'static> Probe<T> {
    /// Subscribe on the current thread with no initial demand. Safe for any
    /// publisher that does not block while demand is zero.
    pub fn subscribed(publisher: impl Publisher<T> + 'static) -> Self {
        let state = Self::fresh_state();
        Box::new(publisher).subscribe(Box::new(ProbeSubscriber {
            state: state.clone(),
            initial_demand: 0,
        }));
        Self { state }
    }

    /// Subscribe on a helper thread (subscribe drives the pipeline until
    /// demand runs out) and request `initial_demand` from inside
    /// on_subscribe, the way a real sink does. Required for publishers with
    /// a threaded_worker in the chain.
    pub fn subscribed_with_demand(
        publisher: impl Publisher<T> + 'static,
        initial_demand: u64,
    ) -> Self {
        let state = Self::fresh_state();
        let subscriber_state = state.clone();
        std::thread::spawn(move || {
            Box::new(publisher).subscribe(Box::new(ProbeSubscriber {
                state: subscriber_state,
                initial_demand,
            }));
        });
        let probe = Self { state };
        assert!(
            probe.wait_until(|s| s.subscription.is_some()),
            "publisher never delivered on_subscribe"
        );
        probe
    }

    fn fresh_state() -> Arc<Mutex<ProbeState<T>>> {
        Arc::new(Mutex::new(ProbeState {
            subscription: None,
            elements: Vec::new(),
            completed: false,
            error: None,
        }))
    }

    pub fn request(&self, n: u64) {
        let subscription = self.state.lock().subscription.clone();
        subscription.expect("probe not subscribed").request(n);
    }

    pub fn cancel(&self) {
        let subscription = self.state.lock().subscription.clone();
        subscription.expect("probe not subscribed").cancel();
    }

    pub fn elements(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.state.lock().elements.clone()
    }

    pub fn element_count(&self) -> usize {
        self.state.lock().elements.len()
    }

    pub fn completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Poll until `pred` holds or two seconds pass. For worker-thread tests.
    pub fn wait_until(&self, pred: impl Fn(&ProbeState<T>) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if pred(&self.state.lock()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}
