// crates/framebot-bus/src/sink.rs
//
// Bus message sink: terminates a bot-output stream by publishing each
// message on the channel chosen by its kind. Frames are not published by
// the bot variant; they end here.

use crossbeam_channel::Sender;
use serde_json::Value;
use tracing::{debug, warn};

use framebot_core::{metrics, BotOutput, MessageKind};
use framebot_streams::{StreamError, Subscriber, Subscription};

use crate::resilient::ResilientClient;

/// Outbound channel names, one per message kind.
#[derive(Clone, Debug)]
pub struct ChannelNames {
    pub analysis: String,
    pub debug: String,
    pub control: String,
}

impl ChannelNames {
    /// Conventional names derived from a base channel.
    pub fn for_base(base: &str) -> Self {
        Self {
            analysis: format!("{base}/analysis"),
            debug: format!("{base}/debug"),
            control: format!("{base}/control"),
        }
    }

    fn for_kind(&self, kind: MessageKind) -> &str {
        match kind {
            MessageKind::Analysis => &self.analysis,
            MessageKind::Debug => &self.debug,
            MessageKind::Control => &self.control,
        }
    }
}

/// Stream terminal. The pipeline outcome is reported once through `done`.
pub struct BusMessageSink {
    client: ResilientClient,
    channels: ChannelNames,
    done: Sender<Result<(), StreamError>>,
    subscription: Option<Subscription>,
    terminated: bool,
}

impl BusMessageSink {
    pub fn new(
        client: ResilientClient,
        channels: ChannelNames,
        done: Sender<Result<(), StreamError>>,
    ) -> Self {
        Self { client, channels, done, subscription: None, terminated: false }
    }

    fn publish(&self, kind: MessageKind, data: Value) {
        let channel = self.channels.for_kind(kind).to_string();
        let ack_channel = channel.clone();
        self.client.publish(
            &channel,
            data,
            Some(Box::new(move |result| {
                if let Err(e) = result {
                    warn!(channel = %ack_channel, "publish failed: {e}");
                } else {
                    metrics::global().counter("bus_messages_published").increment();
                }
            })),
        );
    }
}

impl Subscriber<BotOutput> for BusMessageSink {
    fn on_subscribe(&mut self, subscription: Subscription) {
        subscription.request(1);
        self.subscription = Some(subscription);
    }

    fn on_next(&mut self, output: BotOutput) {
        if self.terminated {
            return;
        }
        match output {
            BotOutput::Message(message) => self.publish(message.kind, message.data),
            // The bot variant does not publish frames.
            BotOutput::Frame(frame) => {
                debug!(frame_id = ?frame.frame_id, "dropping frame at bus sink");
            }
        }
        if let Some(subscription) = &self.subscription {
            subscription.request(1);
        }
    }

    fn on_complete(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        let _ = self.done.send(Ok(()));
    }

    fn on_error(&mut self, error: StreamError) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        let _ = self.done.send(Err(error));
    }
}
