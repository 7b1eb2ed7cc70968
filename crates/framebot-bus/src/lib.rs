// crates/framebot-bus/src/lib.rs

pub mod client;
pub mod io;
pub mod resilient;
pub mod sink;
pub mod source;
pub mod wire;

pub use client::{
    BusClient, BusError, ChannelObserver, ClientFactory, HistoryOptions, PublishAck, Result,
    SharedObserver, StatusCallback, SubscribeOptions, SubscriptionId, WeakObserver,
};
pub use io::IoLoop;
pub use resilient::ResilientClient;
pub use sink::{BusMessageSink, ChannelNames};
pub use source::{bus_source, BusSourceChannels};
