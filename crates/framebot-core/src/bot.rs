// crates/framebot-core/src/bot.rs
//
// The bot instance: batches of decoded frames go in, the user's callbacks
// run, and frames plus stamped messages come out. run_bot() is the operator
// form; shutdown drains a final message burst through a stateful generator
// appended to the main stream.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use framebot_streams::generators::stateful;
use framebot_streams::publishers;
use framebot_streams::{concat, BoxPublisher, Publisher, PublisherExt};

use crate::frame::{FrameId, ImageMetadata, ImagePacket, OwnedImageFrame};
use crate::messages::{BotInput, BotMessage, BotOutput, MessageKind};
use crate::metrics::{self, Counter};

/// Called with each batch of decoded frames. `current_frame_id` is the last
/// frame of the batch for the duration of the call; messages queued through
/// the context are emitted right after the batch's frames.
pub type ImageCallback = Box<dyn FnMut(&mut BotContext, &[OwnedImageFrame]) + Send>;

/// Called with control messages addressed to this bot (and the synthesized
/// configure/shutdown actions). A non-null object returned is published
/// back as a CONTROL (or DEBUG, for configure/shutdown) message.
pub type ControlCallback = Box<dyn FnMut(&mut BotContext, &Value) -> Option<Value> + Send>;

pub struct BotDescriptor {
    pub image_callback: ImageCallback,
    pub control_callback: Option<ControlCallback>,
}

pub struct BotOptions {
    pub bot_id: String,
    /// Configuration object dispatched at startup. Providing one without a
    /// control callback is a contract violation.
    pub config: Option<Value>,
}

/// The callback-facing slice of the bot instance.
pub struct BotContext {
    bot_id: String,
    current_frame_id: FrameId,
    message_buffer: VecDeque<BotMessage>,
}

impl BotContext {
    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn current_frame_id(&self) -> FrameId {
        self.current_frame_id
    }

    /// Queue an outbound message. An unassigned `frame_id` is replaced by
    /// the frame currently being processed, when there is one.
    pub fn queue_message(&mut self, kind: MessageKind, data: Value, frame_id: FrameId) {
        let frame_id = if frame_id.is_unassigned() && !self.current_frame_id.is_unassigned() {
            self.current_frame_id
        } else {
            frame_id
        };
        self.message_buffer.push_back(BotMessage { kind, data, frame_id });
    }

    /// Frame context for replies synthesized outside an image callback.
    fn reply_frame_id(&self) -> FrameId {
        if self.current_frame_id.is_unassigned() {
            FrameId::new(-1, -1)
        } else {
            self.current_frame_id
        }
    }
}

struct BotInstance {
    context: BotContext,
    descriptor: BotDescriptor,
    image_metadata: Option<ImageMetadata>,
    sent_analysis: Arc<Counter>,
    sent_debug: Arc<Counter>,
    sent_control: Arc<Counter>,
}

impl BotInstance {
    fn new(bot_id: String, descriptor: BotDescriptor) -> Self {
        let registry = metrics::global();
        Self {
            context: BotContext {
                bot_id,
                current_frame_id: FrameId::UNASSIGNED,
                message_buffer: VecDeque::new(),
            },
            descriptor,
            image_metadata: None,
            sent_analysis: registry.counter("messages_sent_analysis"),
            sent_debug: registry.counter("messages_sent_debug"),
            sent_control: registry.counter("messages_sent_control"),
        }
    }

    /// Startup configure dispatch. Panics when a configuration is supplied
    /// but no control callback exists to receive it.
    fn configure(&mut self, config: Option<Value>) {
        let config = config.filter(|v| !v.is_null());
        let Some(callback) = self.descriptor.control_callback.as_mut() else {
            if config.is_some() {
                panic!("bot configuration provided but no control callback registered");
            }
            return;
        };
        let message = json!({
            "action": "configure",
            "body": config.unwrap_or_else(|| json!({})),
        });
        let response = callback(&mut self.context, &message);
        if let Some(response) = response.filter(|v| !v.is_null()) {
            let frame_id = self.context.reply_frame_id();
            self.context
                .message_buffer
                .push_back(BotMessage { kind: MessageKind::Debug, data: response, frame_id });
        }
    }

    fn process(&mut self, input: BotInput) -> Vec<BotOutput> {
        match input {
            BotInput::Batch(packets) => self.process_batch(packets),
            BotInput::Control(message) => self.process_control(message),
        }
    }

    fn process_batch(&mut self, packets: VecDeque<ImagePacket>) -> Vec<BotOutput> {
        let mut frames: Vec<OwnedImageFrame> = Vec::with_capacity(packets.len());
        for packet in packets {
            match packet {
                ImagePacket::Metadata(metadata) => self.latch_metadata(metadata),
                ImagePacket::Frame(frame) => {
                    self.check_frame_geometry(&frame);
                    frames.push(frame);
                }
            }
        }

        if let Some(last) = frames.last() {
            self.context.current_frame_id = last.frame_id;
            (self.descriptor.image_callback)(&mut self.context, &frames);
        }

        let mut outputs: Vec<BotOutput> = frames.into_iter().map(BotOutput::Frame).collect();
        outputs.extend(self.drain_messages().into_iter().map(BotOutput::Message));
        outputs
    }

    fn process_control(&mut self, message: Value) -> Vec<BotOutput> {
        let message = match message {
            Value::Array(messages) => {
                return messages.into_iter().flat_map(|m| self.process_control(m)).collect();
            }
            other => other,
        };
        let Some(fields) = message.as_object() else {
            warn!("dropping control message that is not an object: {message}");
            return Vec::new();
        };
        let Some(to) = fields.get("to").and_then(Value::as_str) else {
            warn!("dropping control message without a \"to\" field");
            return Vec::new();
        };
        if !self.context.bot_id.is_empty() && to != self.context.bot_id {
            return Vec::new();
        }
        let Some(callback) = self.descriptor.control_callback.as_mut() else {
            debug!("control message received but bot has no control callback");
            return Vec::new();
        };

        let response = callback(&mut self.context, &message);
        if let Some(mut response) = response.filter(|v| !v.is_null()) {
            match response.as_object_mut() {
                Some(reply) => {
                    if let Some(request_id) = fields.get("request_id") {
                        reply.insert("request_id".to_string(), request_id.clone());
                    }
                    let frame_id = self.context.reply_frame_id();
                    self.context.message_buffer.push_back(BotMessage {
                        kind: MessageKind::Control,
                        data: response,
                        frame_id,
                    });
                }
                None => warn!("dropping non-object control response: {response}"),
            }
        }

        self.drain_messages().into_iter().map(BotOutput::Message).collect()
    }

    /// Shutdown dispatch: ask the bot for a final word, queue it as DEBUG.
    fn begin_shutdown(&mut self) {
        if let Some(callback) = self.descriptor.control_callback.as_mut() {
            let message = json!({ "action": "shutdown" });
            let response = callback(&mut self.context, &message);
            if let Some(response) = response.filter(|v| !v.is_null()) {
                let frame_id = self.context.reply_frame_id();
                self.context.message_buffer.push_back(BotMessage {
                    kind: MessageKind::Debug,
                    data: response,
                    frame_id,
                });
            }
        }
    }

    fn drain_messages(&mut self) -> Vec<BotMessage> {
        let mut drained = Vec::with_capacity(self.context.message_buffer.len());
        while let Some(message) = self.drain_one() {
            drained.push(message);
        }
        drained
    }

    fn drain_one(&mut self) -> Option<BotMessage> {
        let mut message = self.context.message_buffer.pop_front()?;
        self.stamp(&mut message);
        Some(message)
    }

    fn stamp(&self, message: &mut BotMessage) {
        match message.kind {
            MessageKind::Analysis => self.sent_analysis.increment(),
            MessageKind::Debug => self.sent_debug.increment(),
            MessageKind::Control => self.sent_control.increment(),
        }
        let Some(fields) = message.data.as_object_mut() else {
            panic!("queued bot message data must be an object, got: {}", message.data);
        };
        if message.frame_id.i1 >= 0 {
            fields.insert(
                "i".to_string(),
                json!([message.frame_id.i1, message.frame_id.i2]),
            );
        }
        if !self.context.bot_id.is_empty() {
            fields.insert("from".to_string(), Value::String(self.context.bot_id.clone()));
        }
    }

    fn latch_metadata(&mut self, metadata: ImageMetadata) {
        match self.image_metadata {
            None => self.image_metadata = Some(metadata),
            Some(latched) => {
                if latched.width != metadata.width || latched.height != metadata.height {
                    panic!(
                        "image geometry changed mid-stream: {}x{} -> {}x{}",
                        latched.width, latched.height, metadata.width, metadata.height
                    );
                }
                // Same geometry: refresh format/stride details.
                self.image_metadata = Some(metadata);
            }
        }
    }

    fn check_frame_geometry(&mut self, frame: &OwnedImageFrame) {
        match self.image_metadata {
            None => {
                self.image_metadata = Some(ImageMetadata {
                    width: frame.width,
                    height: frame.height,
                    plane_strides: frame.plane_strides,
                    pixel_format: crate::frame::PixelFormat::Rgb0,
                });
            }
            Some(latched) => {
                if latched.width != frame.width || latched.height != frame.height {
                    panic!(
                        "frame geometry violates latched metadata: expected {}x{}, got {}x{}",
                        latched.width, latched.height, frame.width, frame.height
                    );
                }
            }
        }
    }
}

/// Transform a stream of bot inputs into the bot's output stream. The
/// configure dispatch runs synchronously before the first element; the
/// shutdown burst is appended after the main stream completes.
pub fn run_bot<P>(
    upstream: P,
    descriptor: BotDescriptor,
    options: BotOptions,
) -> impl Publisher<BotOutput>
where
    P: Publisher<BotInput> + 'static,
{
    let mut instance = BotInstance::new(options.bot_id, descriptor);
    instance.configure(options.config);
    let instance = Arc::new(Mutex::new(instance));

    let main = {
        let instance = instance.clone();
        upstream
            .map(move |input| {
                let outputs = instance.lock().process(input);
                Box::new(publishers::of(outputs)) as BoxPublisher<BotOutput>
            })
            .flatten()
    };

    let shutdown_burst = stateful(
        {
            let instance = instance.clone();
            move || {
                instance.lock().begin_shutdown();
                instance
            }
        },
        |instance, sink| match instance.lock().drain_one() {
            Some(message) => sink.on_next(BotOutput::Message(message)),
            None => sink.on_complete(),
        },
    );

    concat(main, shutdown_burst)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use framebot_streams::{StreamError, Subscriber, Subscription};

    fn frame(i1: i64, i2: i64, width: u32, height: u32) -> OwnedImageFrame {
        OwnedImageFrame {
            frame_id: FrameId::new(i1, i2),
            width,
            height,
            plane_strides: [width * 4, 0, 0, 0],
            plane_data: [vec![0u8; (width * height * 4) as usize], vec![], vec![], vec![]],
        }
    }

    fn batch(frames: Vec<OwnedImageFrame>) -> BotInput {
        BotInput::Batch(frames.into_iter().map(ImagePacket::Frame).collect())
    }

    struct Collected {
        outputs: Arc<Mutex<Vec<BotOutput>>>,
        completed: Arc<AtomicBool>,
    }

    struct CollectSubscriber {
        outputs: Arc<Mutex<Vec<BotOutput>>>,
        completed: Arc<AtomicBool>,
    }

    impl Subscriber<BotOutput> for CollectSubscriber {
        fn on_subscribe(&mut self, subscription: Subscription) {
            subscription.request(1_000_000);
        }
        fn on_next(&mut self, element: BotOutput) {
            self.outputs.lock().push(element);
        }
        fn on_complete(&mut self) {
            self.completed.store(true, Ordering::SeqCst);
        }
        fn on_error(&mut self, error: StreamError) {
            panic!("unexpected stream error: {error}");
        }
    }

    fn run_collect(publisher: impl Publisher<BotOutput> + 'static) -> Collected {
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicBool::new(false));
        Box::new(publisher).subscribe(Box::new(CollectSubscriber {
            outputs: outputs.clone(),
            completed: completed.clone(),
        }));
        Collected { outputs, completed }
    }

    fn noop_image_callback() -> ImageCallback {
        Box::new(|_, _| {})
    }

    fn message_outputs(collected: &Collected) -> Vec<BotMessage> {
        collected
            .outputs
            .lock()
            .iter()
            .filter_map(|o| match o {
                BotOutput::Message(m) => Some(m.clone()),
                BotOutput::Frame(_) => None,
            })
            .collect()
    }

    #[test]
    fn configure_then_shutdown_on_empty_stream() {
        let calls = Arc::new(Mutex::new(Vec::<Value>::new()));
        let recorded = calls.clone();
        let descriptor = BotDescriptor {
            image_callback: noop_image_callback(),
            control_callback: Some(Box::new(move |_, message| {
                recorded.lock().push(message.clone());
                None
            })),
        };
        let collected = run_collect(run_bot(
            publishers::empty::<BotInput>(),
            descriptor,
            BotOptions { bot_id: "b1".into(), config: Some(json!({"k": 1})) },
        ));

        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], json!({"action": "configure", "body": {"k": 1}}));
        assert_eq!(calls[1], json!({"action": "shutdown"}));
        assert!(collected.outputs.lock().is_empty());
        assert!(collected.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn single_frame_batch_passes_frame_through() {
        let seen = Arc::new(Mutex::new(Vec::<usize>::new()));
        let recorded = seen.clone();
        let descriptor = BotDescriptor {
            image_callback: Box::new(move |_, frames| {
                recorded.lock().push(frames.len());
            }),
            control_callback: None,
        };
        let collected = run_collect(run_bot(
            publishers::of(vec![batch(vec![frame(10, 11, 640, 480)])]),
            descriptor,
            BotOptions { bot_id: "b1".into(), config: None },
        ));

        assert_eq!(*seen.lock(), vec![1]);
        let outputs = collected.outputs.lock();
        assert_eq!(outputs.len(), 1);
        match &outputs[0] {
            BotOutput::Frame(f) => {
                assert_eq!(f.frame_id, FrameId::new(10, 11));
                assert_eq!((f.width, f.height), (640, 480));
            }
            other => panic!("expected a frame, got {other:?}"),
        }
        assert!(collected.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn queued_message_is_stamped_with_frame_and_bot_id() {
        let descriptor = BotDescriptor {
            image_callback: Box::new(|context, _frames| {
                context.queue_message(
                    MessageKind::Analysis,
                    json!({"x": 3}),
                    FrameId::UNASSIGNED,
                );
            }),
            control_callback: None,
        };
        let collected = run_collect(run_bot(
            publishers::of(vec![batch(vec![frame(20, 21, 64, 48)])]),
            descriptor,
            BotOptions { bot_id: "b1".into(), config: None },
        ));

        let messages = message_outputs(&collected);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Analysis);
        assert_eq!(messages[0].data, json!({"x": 3, "i": [20, 21], "from": "b1"}));
    }

    #[test]
    fn explicit_frame_id_is_used_verbatim() {
        let descriptor = BotDescriptor {
            image_callback: Box::new(|context, _frames| {
                context.queue_message(MessageKind::Analysis, json!({}), FrameId::new(30, 31));
            }),
            control_callback: None,
        };
        let collected = run_collect(run_bot(
            publishers::of(vec![batch(vec![frame(20, 21, 64, 48)])]),
            descriptor,
            BotOptions { bot_id: "b1".into(), config: None },
        ));

        let messages = message_outputs(&collected);
        assert_eq!(messages[0].data["i"], json!([30, 31]));
    }

    #[test]
    fn control_for_another_bot_is_dropped() {
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let descriptor = BotDescriptor {
            image_callback: noop_image_callback(),
            control_callback: Some(Box::new(move |_, message| {
                // Ignore the shutdown dispatch; only routed messages count.
                if message.get("action").is_none() {
                    flag.store(true, Ordering::SeqCst);
                }
                None
            })),
        };
        let collected = run_collect(run_bot(
            publishers::of(vec![BotInput::Control(
                json!({"to": "b2", "request_id": "r", "cmd": "ping"}),
            )]),
            descriptor,
            BotOptions { bot_id: "b1".into(), config: None },
        ));

        assert!(!invoked.load(Ordering::SeqCst));
        assert!(collected.outputs.lock().is_empty());
    }

    #[test]
    fn matched_control_gets_reply_with_request_id() {
        let descriptor = BotDescriptor {
            image_callback: noop_image_callback(),
            control_callback: Some(Box::new(|_, message| {
                if message.get("action").is_some() {
                    return None;
                }
                Some(json!({"pong": true}))
            })),
        };
        let collected = run_collect(run_bot(
            publishers::of(vec![BotInput::Control(
                json!({"to": "b1", "request_id": "r", "cmd": "ping"}),
            )]),
            descriptor,
            BotOptions { bot_id: "b1".into(), config: None },
        ));

        let messages = message_outputs(&collected);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Control);
        assert_eq!(
            messages[0].data,
            json!({"pong": true, "request_id": "r", "from": "b1"})
        );
        assert!(messages[0].data.get("i").is_none());
    }

    #[test]
    fn control_array_is_processed_elementwise() {
        let descriptor = BotDescriptor {
            image_callback: noop_image_callback(),
            control_callback: Some(Box::new(|_, message| {
                if message.get("action").is_some() {
                    return None;
                }
                Some(json!({"seq": message["n"]}))
            })),
        };
        let collected = run_collect(run_bot(
            publishers::of(vec![BotInput::Control(json!([
                {"to": "b1", "n": 1},
                {"to": "someone-else", "n": 2},
                {"to": "b1", "n": 3},
            ]))]),
            descriptor,
            BotOptions { bot_id: "b1".into(), config: None },
        ));

        let messages = message_outputs(&collected);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].data["seq"], json!(1));
        assert_eq!(messages[1].data["seq"], json!(3));
    }

    #[test]
    fn control_without_to_field_is_dropped() {
        let descriptor = BotDescriptor {
            image_callback: noop_image_callback(),
            control_callback: Some(Box::new(|_, _| Some(json!({"never": true})))),
        };
        let collected = run_collect(run_bot(
            publishers::of(vec![BotInput::Control(json!({"cmd": "ping"}))]),
            descriptor,
            BotOptions { bot_id: "".into(), config: None },
        ));

        // Only the shutdown reply comes out; the unaddressed control is gone.
        let messages = message_outputs(&collected);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Debug);
    }

    #[test]
    fn empty_bot_id_receives_any_addressee_and_omits_from() {
        let descriptor = BotDescriptor {
            image_callback: noop_image_callback(),
            control_callback: Some(Box::new(|_, message| {
                if message.get("action").is_some() {
                    return None;
                }
                Some(json!({"ok": true}))
            })),
        };
        let collected = run_collect(run_bot(
            publishers::of(vec![BotInput::Control(json!({"to": "anyone"}))]),
            descriptor,
            BotOptions { bot_id: "".into(), config: None },
        ));

        let messages = message_outputs(&collected);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, json!({"ok": true}));
    }

    #[test]
    fn shutdown_reply_is_emitted_as_debug_after_main_stream() {
        let descriptor = BotDescriptor {
            image_callback: noop_image_callback(),
            control_callback: Some(Box::new(|_, message| {
                if message["action"] == json!("shutdown") {
                    Some(json!({"bye": true}))
                } else {
                    None
                }
            })),
        };
        let collected = run_collect(run_bot(
            publishers::of(vec![batch(vec![frame(1, 2, 16, 16)])]),
            descriptor,
            BotOptions { bot_id: "b1".into(), config: None },
        ));

        let outputs = collected.outputs.lock();
        assert_eq!(outputs.len(), 2);
        assert!(matches!(outputs[0], BotOutput::Frame(_)));
        match &outputs[1] {
            BotOutput::Message(m) => {
                assert_eq!(m.kind, MessageKind::Debug);
                assert_eq!(m.data["bye"], json!(true));
            }
            other => panic!("expected shutdown reply, got {other:?}"),
        }
        assert!(collected.completed.load(Ordering::SeqCst));
    }

    #[test]
    fn sent_metrics_are_recorded_by_kind() {
        let before = metrics::global().counter("messages_sent_analysis").value();
        let descriptor = BotDescriptor {
            image_callback: Box::new(|context, _| {
                context.queue_message(MessageKind::Analysis, json!({}), FrameId::UNASSIGNED);
            }),
            control_callback: None,
        };
        run_collect(run_bot(
            publishers::of(vec![batch(vec![frame(1, 2, 8, 8)])]),
            descriptor,
            BotOptions { bot_id: "b1".into(), config: None },
        ));
        let after = metrics::global().counter("messages_sent_analysis").value();
        assert!(after > before);
    }

    #[test]
    #[should_panic(expected = "geometry")]
    fn frame_geometry_change_is_fatal() {
        let descriptor = BotDescriptor {
            image_callback: noop_image_callback(),
            control_callback: None,
        };
        run_collect(run_bot(
            publishers::of(vec![
                batch(vec![frame(1, 2, 640, 480)]),
                batch(vec![frame(2, 3, 320, 240)]),
            ]),
            descriptor,
            BotOptions { bot_id: "b1".into(), config: None },
        ));
    }

    #[test]
    #[should_panic(expected = "control callback")]
    fn config_without_control_callback_is_fatal() {
        let descriptor = BotDescriptor {
            image_callback: noop_image_callback(),
            control_callback: None,
        };
        run_collect(run_bot(
            publishers::empty::<BotInput>(),
            descriptor,
            BotOptions { bot_id: "b1".into(), config: Some(json!({"k": 1})) },
        ));
    }

    #[test]
    #[should_panic(expected = "must be an object")]
    fn non_object_message_data_is_fatal() {
        let descriptor = BotDescriptor {
            image_callback: Box::new(|context, _| {
                context.queue_message(MessageKind::Analysis, json!(42), FrameId::UNASSIGNED);
            }),
            control_callback: None,
        };
        run_collect(run_bot(
            publishers::of(vec![batch(vec![frame(1, 2, 8, 8)])]),
            descriptor,
            BotOptions { bot_id: "b1".into(), config: None },
        ));
    }
}
