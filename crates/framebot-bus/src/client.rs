// crates/framebot-bus/src/client.rs
//
// The messaging-bus client surface the pipeline is written against. The
// concrete wire dialect lives behind this trait; the resilient wrapper in
// resilient.rs interposes on it one-to-one.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use framebot_core::ChannelPosition;

pub type Result<T, E = BusError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("subscribe rejected on channel {channel}: {reason}")]
    SubscribeRejected { channel: String, reason: String },
    #[error("publish failed on channel {channel}: {reason}")]
    PublishFailed { channel: String, reason: String },
    #[error("client restart failed: {0}")]
    RestartFailed(String),
    #[error("client is stopped")]
    Stopped,
}

/// Receives data and errors for one channel subscription. The client holds
/// the observer weakly; its lifetime belongs to the subscriber.
pub trait ChannelObserver: Send {
    fn on_data(&mut self, message: Value);
    fn on_error(&mut self, error: BusError);
}

pub type SharedObserver = Arc<Mutex<dyn ChannelObserver>>;
pub type WeakObserver = Weak<Mutex<dyn ChannelObserver>>;

/// Completion callback for one publish.
pub type PublishAck = Box<dyn FnOnce(Result<()>) + Send>;

/// Client-level error reporting, installed at start().
pub type StatusCallback = Box<dyn FnMut(BusError) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HistoryOptions {
    pub count: Option<u64>,
    pub age: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub force: bool,
    pub fast_forward: bool,
    pub history: HistoryOptions,
    pub position: Option<ChannelPosition>,
}

/// A bus client. All methods must be invoked on the I/O loop thread; the
/// resilient wrapper re-posts calls that arrive from elsewhere.
pub trait BusClient: Send {
    fn start(&mut self, status: StatusCallback) -> Result<()>;
    fn stop(&mut self);
    fn publish(&mut self, channel: &str, message: Value, ack: Option<PublishAck>);
    fn subscribe(
        &mut self,
        id: SubscriptionId,
        channel: &str,
        options: SubscribeOptions,
        observer: WeakObserver,
    ) -> Result<()>;
    fn unsubscribe(&mut self, id: SubscriptionId);
}

/// Builds a fresh delegate; called at start and on every restart.
pub type ClientFactory = Box<dyn FnMut() -> Result<Box<dyn BusClient>> + Send>;
