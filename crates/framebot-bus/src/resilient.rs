// crates/framebot-bus/src/resilient.rs
//
// Resilient wrapper around a bus client. Interposes on the client surface
// one-to-one, records live subscriptions, and on any delegate error stops
// the delegate, builds a fresh one through the factory, and replays every
// recorded subscription in insertion order. All mutating work runs on the
// I/O loop thread; calls from other threads are re-posted there.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, warn};

use framebot_core::metrics;

use crate::client::{
    BusClient, BusError, ChannelObserver, ClientFactory, PublishAck, SharedObserver,
    StatusCallback, SubscribeOptions, SubscriptionId, WeakObserver,
};
use crate::io::IoLoop;

#[derive(Clone)]
pub struct ResilientClient {
    inner: Arc<Inner>,
}

struct Inner {
    io: Arc<IoLoop>,
    state: Mutex<State>,
}

struct State {
    factory: ClientFactory,
    delegate: Option<Box<dyn BusClient>>,
    records: Vec<SubscriptionRecord>,
    status: Option<StatusCallback>,
    restarting: bool,
    stopped: bool,
}

struct SubscriptionRecord {
    id: SubscriptionId,
    channel: String,
    options: SubscribeOptions,
    /// The caller's observer; held weakly, per the ownership contract.
    user: WeakObserver,
    /// The interposed observer handed to the delegate. Owned here so the
    /// delegate's weak reference stays valid across restarts.
    wrapped: SharedObserver,
}

impl ResilientClient {
    pub fn new(io: Arc<IoLoop>, factory: ClientFactory) -> Self {
        Self {
            inner: Arc::new(Inner {
                io,
                state: Mutex::new(State {
                    factory,
                    delegate: None,
                    records: Vec::new(),
                    status: None,
                    restarting: false,
                    stopped: false,
                }),
            }),
        }
    }

    pub fn io(&self) -> &Arc<IoLoop> {
        &self.inner.io
    }

    /// Build and start the first delegate. Startup failure is reported
    /// through `status`.
    pub fn start(&self, status: StatusCallback) {
        let inner = self.inner.clone();
        self.inner.io.run_or_post(move || {
            let mut state = inner.state.lock();
            state.status = Some(status);
            let delegate_status = Inner::delegate_status(&inner);
            let outcome = (state.factory)()
                .and_then(|mut delegate| delegate.start(delegate_status).map(|()| delegate));
            match outcome {
                Ok(delegate) => state.delegate = Some(delegate),
                Err(e) => Inner::report_fatal(&mut state, e),
            }
        });
    }

    pub fn stop(&self) {
        let inner = self.inner.clone();
        self.inner.io.run_or_post(move || {
            let mut state = inner.state.lock();
            state.stopped = true;
            if let Some(mut delegate) = state.delegate.take() {
                delegate.stop();
            }
        });
    }

    pub fn publish(&self, channel: &str, message: Value, ack: Option<PublishAck>) {
        let inner = self.inner.clone();
        let channel = channel.to_string();
        self.inner.io.run_or_post(move || {
            let mut state = inner.state.lock();
            match state.delegate.as_mut() {
                Some(delegate) => delegate.publish(&channel, message, ack),
                None => {
                    if let Some(ack) = ack {
                        ack(Err(BusError::Stopped));
                    }
                }
            }
        });
    }

    /// Record the subscription and issue it on the current delegate. The
    /// returned id is valid immediately and survives restarts.
    pub fn subscribe(
        &self,
        channel: &str,
        options: SubscribeOptions,
        observer: WeakObserver,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let wrapped: SharedObserver = Arc::new(Mutex::new(WrapObserver {
            user: observer.clone(),
            inner: Arc::downgrade(&self.inner),
        }));
        let record = SubscriptionRecord {
            id,
            channel: channel.to_string(),
            options,
            user: observer,
            wrapped,
        };
        let inner = self.inner.clone();
        self.inner.io.run_or_post(move || {
            let mut state = inner.state.lock();
            if state.stopped {
                return;
            }
            let delegate_observer = Arc::downgrade(&record.wrapped);
            let (id, channel, options) = (record.id, record.channel.clone(), record.options);
            state.records.push(record);
            if let Some(delegate) = state.delegate.as_mut() {
                if let Err(e) = delegate.subscribe(id, &channel, options, delegate_observer) {
                    warn!(%channel, "subscribe rejected, restarting client: {e}");
                    drop(state);
                    Inner::schedule_restart(&inner);
                }
            }
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let inner = self.inner.clone();
        self.inner.io.run_or_post(move || {
            let mut state = inner.state.lock();
            state.records.retain(|record| record.id != id);
            if let Some(delegate) = state.delegate.as_mut() {
                delegate.unsubscribe(id);
            }
        });
    }
}

impl Inner {
    /// The status callback handed to every delegate: any reported error
    /// schedules a restart on the I/O loop.
    fn delegate_status(inner: &Arc<Inner>) -> StatusCallback {
        let weak = Arc::downgrade(inner);
        Box::new(move |error: BusError| {
            let Some(inner) = weak.upgrade() else { return };
            warn!("bus client error, scheduling restart: {error}");
            Self::schedule_restart(&inner);
        })
    }

    fn schedule_restart(inner: &Arc<Inner>) {
        let weak = Arc::downgrade(inner);
        inner.io.post(move || {
            if let Some(inner) = weak.upgrade() {
                Self::restart(&inner);
            }
        });
    }

    /// Stop the delegate, build and start a fresh one, replay every live
    /// subscription in insertion order. Failures here are fatal and go to
    /// the outer status callback.
    fn restart(inner: &Arc<Inner>) {
        let mut state = inner.state.lock();
        if state.stopped || state.restarting {
            return;
        }
        state.restarting = true;
        metrics::global().counter("bus_client_restarts").increment();

        if let Some(mut old) = state.delegate.take() {
            old.stop();
        }

        let delegate_status = Self::delegate_status(inner);
        let outcome = (state.factory)()
            .and_then(|mut delegate| delegate.start(delegate_status).map(|()| delegate));
        let mut delegate = match outcome {
            Ok(delegate) => delegate,
            Err(e) => {
                Self::report_fatal(&mut state, e);
                state.restarting = false;
                return;
            }
        };

        // Subscriptions whose observers are gone are dead; drop them
        // instead of replaying.
        state.records.retain(|record| record.user.upgrade().is_some());

        let mut replay_error = None;
        for record in &state.records {
            debug!(channel = %record.channel, "replaying subscription");
            if let Err(e) = delegate.subscribe(
                record.id,
                &record.channel,
                record.options,
                Arc::downgrade(&record.wrapped),
            ) {
                replay_error = Some(e);
                break;
            }
        }

        match replay_error {
            Some(e) => Self::report_fatal(&mut state, e),
            None => state.delegate = Some(delegate),
        }
        state.restarting = false;
    }

    fn report_fatal(state: &mut State, cause: BusError) {
        error!("bus client restart failed: {cause}");
        state.stopped = true;
        if let Some(status) = state.status.as_mut() {
            status(BusError::RestartFailed(cause.to_string()));
        }
    }
}

/// Interposed channel observer: forwards to the caller's observer and turns
/// any reported error into a client restart.
struct WrapObserver {
    user: WeakObserver,
    inner: Weak<Inner>,
}

impl ChannelObserver for WrapObserver {
    fn on_data(&mut self, message: Value) {
        if let Some(user) = self.user.upgrade() {
            user.lock().on_data(message);
        }
    }

    fn on_error(&mut self, error: BusError) {
        let forwarded = BusError::Transport(error.to_string());
        if let Some(user) = self.user.upgrade() {
            user.lock().on_error(forwarded);
        }
        if let Some(inner) = self.inner.upgrade() {
            Inner::schedule_restart(&inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    /// Scripted delegate that logs every call and can fail its first
    /// subscribe by reporting a transport error through the status callback.
    struct FakeDelegate {
        generation: u32,
        log: Arc<Mutex<Vec<String>>>,
        io: Arc<IoLoop>,
        status: Option<StatusCallback>,
        fail_first_subscribe: bool,
        subscribes_seen: u32,
    }

    impl FakeDelegate {
        fn log(&self, entry: String) {
            assert!(self.io.on_loop_thread(), "delegate called off the i/o thread");
            self.log.lock().push(entry);
        }
    }

    impl BusClient for FakeDelegate {
        fn start(&mut self, status: StatusCallback) -> crate::client::Result<()> {
            self.log(format!("start:{}", self.generation));
            self.status = Some(status);
            Ok(())
        }

        fn stop(&mut self) {
            self.log(format!("stop:{}", self.generation));
        }

        fn publish(&mut self, channel: &str, _message: Value, ack: Option<PublishAck>) {
            self.log(format!("publish:{}:{channel}", self.generation));
            if let Some(ack) = ack {
                ack(Ok(()));
            }
        }

        fn subscribe(
            &mut self,
            _id: SubscriptionId,
            channel: &str,
            _options: SubscribeOptions,
            _observer: WeakObserver,
        ) -> crate::client::Result<()> {
            self.log(format!("subscribe:{}:{channel}", self.generation));
            self.subscribes_seen += 1;
            if self.fail_first_subscribe && self.subscribes_seen == 1 {
                if let Some(status) = self.status.as_mut() {
                    status(BusError::Transport("link dropped".into()));
                }
            }
            Ok(())
        }

        fn unsubscribe(&mut self, id: SubscriptionId) {
            self.log(format!("unsubscribe:{}:{id}", self.generation));
        }
    }

    struct NullObserver;

    impl ChannelObserver for NullObserver {
        fn on_data(&mut self, _message: Value) {}
        fn on_error(&mut self, _error: BusError) {}
    }

    fn wait_for_log(log: &Arc<Mutex<Vec<String>>>, len: usize) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if log.lock().len() >= len {
                return log.lock().clone();
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        log.lock().clone()
    }

    fn scripted_client(
        fail_first: bool,
    ) -> (ResilientClient, Arc<Mutex<Vec<String>>>, Arc<IoLoop>) {
        let io = Arc::new(IoLoop::start());
        let log = Arc::new(Mutex::new(Vec::new()));
        let factory_log = log.clone();
        let factory_io = io.clone();
        let mut generation = 0u32;
        let factory: ClientFactory = Box::new(move || {
            generation += 1;
            factory_log.lock().push(format!("create:{generation}"));
            Ok(Box::new(FakeDelegate {
                generation,
                log: factory_log.clone(),
                io: factory_io.clone(),
                status: None,
                fail_first_subscribe: fail_first && generation == 1,
                subscribes_seen: 0,
            }))
        });
        let client = ResilientClient::new(io.clone(), factory);
        (client, log, io)
    }

    #[test]
    fn failure_recreates_delegate_and_replays_subscriptions_in_order() {
        let (client, log, _io) = scripted_client(true);
        client.start(Box::new(|e| panic!("fatal: {e}")));

        let observer_a: SharedObserver = Arc::new(Mutex::new(NullObserver));
        let observer_b: SharedObserver = Arc::new(Mutex::new(NullObserver));
        client.subscribe("chan-a", SubscribeOptions::default(), Arc::downgrade(&observer_a));
        client.subscribe("chan-b", SubscribeOptions::default(), Arc::downgrade(&observer_b));

        let entries = wait_for_log(&log, 9);
        assert_eq!(
            entries,
            vec![
                "create:1",
                "start:1",
                "subscribe:1:chan-a",
                "subscribe:1:chan-b",
                "stop:1",
                "create:2",
                "start:2",
                "subscribe:2:chan-a",
                "subscribe:2:chan-b",
            ]
        );
    }

    #[test]
    fn dead_observers_are_not_replayed() {
        let (client, log, _io) = scripted_client(true);
        client.start(Box::new(|e| panic!("fatal: {e}")));

        // chan-a's observer is already gone by the time the wrapper records
        // it; the replay after the failure must skip it.
        let observer_a: SharedObserver = Arc::new(Mutex::new(NullObserver));
        let dead = Arc::downgrade(&observer_a);
        drop(observer_a);
        let observer_b: SharedObserver = Arc::new(Mutex::new(NullObserver));
        client.subscribe("chan-a", SubscribeOptions::default(), dead);
        client.subscribe("chan-b", SubscribeOptions::default(), Arc::downgrade(&observer_b));

        let entries = wait_for_log(&log, 8);
        assert!(entries.contains(&"subscribe:2:chan-b".to_string()));
        assert!(!entries.contains(&"subscribe:2:chan-a".to_string()));
    }

    #[test]
    fn factory_failure_is_fatal_to_the_outer_status() {
        let io = Arc::new(IoLoop::start());
        let calls = Arc::new(Mutex::new(0u32));
        let factory_calls = calls.clone();
        let factory: ClientFactory = Box::new(move || {
            *factory_calls.lock() += 1;
            Err(BusError::Transport("no route".into()))
        });
        let client = ResilientClient::new(io, factory);

        let fatal = Arc::new(Mutex::new(None));
        let seen = fatal.clone();
        client.start(Box::new(move |e| {
            *seen.lock() = Some(e.to_string());
        }));

        let deadline = Instant::now() + Duration::from_secs(2);
        while fatal.lock().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let message = fatal.lock().clone().expect("no fatal error reported");
        assert!(message.contains("no route"));
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn publish_is_delegated_with_ack() {
        let (client, log, _io) = scripted_client(false);
        client.start(Box::new(|e| panic!("fatal: {e}")));

        let acked = Arc::new(Mutex::new(false));
        let seen = acked.clone();
        client.publish(
            "chan-out",
            serde_json::json!({"v": 1}),
            Some(Box::new(move |result| {
                *seen.lock() = result.is_ok();
            })),
        );

        let entries = wait_for_log(&log, 3);
        assert!(entries.contains(&"publish:1:chan-out".to_string()));
        let deadline = Instant::now() + Duration::from_secs(2);
        while !*acked.lock() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(*acked.lock());
    }
}
