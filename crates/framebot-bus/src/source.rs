// crates/framebot-bus/src/source.rs
//
// Bus video source: subscribes a metadata channel and a frames channel,
// reassembles chunked frames, and publishes encoded packets. Codec
// parameters are emitted on the first metadata message and on every change;
// frames seen before any metadata are discarded.
//
// The channel observers run on the I/O thread and only enqueue; the pump
// runs on the pipeline thread and polls with a timeout so cancellation is
// observed even when the bus is idle.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use framebot_core::{metrics, CodecParams, EncodedFrame, EncodedPacket, FrameId};
use framebot_streams::generators::{stateful, GeneratorSink};
use framebot_streams::{Publisher, StreamError};

use crate::client::{BusError, ChannelObserver, SharedObserver, SubscribeOptions, SubscriptionId};
use crate::resilient::ResilientClient;
use crate::wire::{NetworkFrame, NetworkMetadata};

const EVENT_QUEUE: usize = 1024;
const POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct BusSourceChannels {
    pub metadata: String,
    pub frames: String,
}

enum SourceEvent {
    Metadata(NetworkMetadata),
    Frame(NetworkFrame),
    Failed(BusError),
}

/// Publisher of encoded packets fed by the two bus channels. Subscriptions
/// are opened lazily, on the first demand.
pub fn bus_source(
    client: ResilientClient,
    channels: BusSourceChannels,
    options: SubscribeOptions,
) -> impl Publisher<EncodedPacket> {
    stateful(
        move || SourceState::open(client, channels, options),
        |state, sink| state.pump(sink),
    )
}

struct SourceState {
    client: ResilientClient,
    rx: Receiver<SourceEvent>,
    // Kept alive here; the client layers only hold them weakly.
    _observers: Vec<SharedObserver>,
    subscription_ids: Vec<SubscriptionId>,
    metadata: Option<NetworkMetadata>,
    assembler: FrameAssembler,
}

impl SourceState {
    fn open(
        client: ResilientClient,
        channels: BusSourceChannels,
        options: SubscribeOptions,
    ) -> Self {
        let (tx, rx) = bounded(EVENT_QUEUE);

        let metadata_observer: SharedObserver = Arc::new(Mutex::new(EnqueueObserver {
            tx: tx.clone(),
            parse: parse_metadata,
            channel: channels.metadata.clone(),
        }));
        let frames_observer: SharedObserver = Arc::new(Mutex::new(EnqueueObserver {
            tx,
            parse: parse_frame,
            channel: channels.frames.clone(),
        }));

        // Late joiners still need the current codec parameters.
        let metadata_options = SubscribeOptions {
            history: crate::client::HistoryOptions { count: Some(1), age: None },
            ..options
        };
        let metadata_id = client.subscribe(
            &channels.metadata,
            metadata_options,
            Arc::downgrade(&metadata_observer),
        );
        let frames_id =
            client.subscribe(&channels.frames, options, Arc::downgrade(&frames_observer));

        Self {
            client,
            rx,
            _observers: vec![metadata_observer, frames_observer],
            subscription_ids: vec![metadata_id, frames_id],
            metadata: None,
            assembler: FrameAssembler::default(),
        }
    }

    fn pump(&mut self, sink: &mut GeneratorSink<EncodedPacket>) {
        match self.rx.recv_timeout(POLL) {
            Ok(SourceEvent::Metadata(metadata)) => self.on_metadata(metadata, sink),
            Ok(SourceEvent::Frame(frame)) => {
                if self.metadata.is_none() {
                    warn!("discarding frame {:?}: no stream metadata yet", frame.i);
                    metrics::global().counter("bus_source_frames_dropped").increment();
                    return;
                }
                if let Some(frame) = self.assembler.push(frame) {
                    metrics::global().counter("bus_source_frames").increment();
                    sink.on_next(EncodedPacket::Frame(frame));
                }
            }
            Ok(SourceEvent::Failed(error)) => {
                sink.on_error(StreamError::Transport(error.to_string()));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                sink.on_error(StreamError::Transport("bus event queue closed".into()));
            }
        }
    }

    fn on_metadata(&mut self, metadata: NetworkMetadata, sink: &mut GeneratorSink<EncodedPacket>) {
        if self.metadata.as_ref() == Some(&metadata) {
            return;
        }
        let extra_data = match metadata.extra_data() {
            Ok(extra_data) => extra_data,
            Err(e) => {
                warn!("dropping stream metadata with bad extra data: {e}");
                return;
            }
        };
        let params = CodecParams {
            codec: metadata.codec.clone(),
            extra_data,
            width: metadata.width.unwrap_or(0),
            height: metadata.height.unwrap_or(0),
        };
        self.metadata = Some(metadata);
        sink.on_next(EncodedPacket::Params(params));
    }
}

impl Drop for SourceState {
    fn drop(&mut self) {
        for id in self.subscription_ids.drain(..) {
            self.client.unsubscribe(id);
        }
    }
}

/// Observer that parses inbound payloads and enqueues them for the pump.
struct EnqueueObserver {
    tx: Sender<SourceEvent>,
    parse: fn(Value) -> Option<SourceEvent>,
    channel: String,
}

impl ChannelObserver for EnqueueObserver {
    fn on_data(&mut self, message: Value) {
        let Some(event) = (self.parse)(message) else {
            warn!(channel = %self.channel, "unparseable bus message dropped");
            return;
        };
        if self.tx.try_send(event).is_err() {
            warn!(channel = %self.channel, "source event queue full, dropping message");
            metrics::global().counter("bus_source_events_dropped").increment();
        }
    }

    fn on_error(&mut self, error: BusError) {
        let _ = self.tx.try_send(SourceEvent::Failed(error));
    }
}

fn parse_metadata(message: Value) -> Option<SourceEvent> {
    serde_json::from_value::<NetworkMetadata>(message)
        .ok()
        .map(SourceEvent::Metadata)
}

fn parse_frame(message: Value) -> Option<SourceEvent> {
    serde_json::from_value::<NetworkFrame>(message)
        .ok()
        .map(SourceEvent::Frame)
}

// ── Chunked frame assembly ────────────────────────────────────────────────────

#[derive(Default)]
struct FrameAssembler {
    partial: Option<PartialFrame>,
}

struct PartialFrame {
    id: FrameId,
    next_chunk: u32,
    chunks: u32,
    key_frame: bool,
    timestamp: Option<f64>,
    data: Vec<u8>,
}

impl PartialFrame {
    fn finish(self) -> EncodedFrame {
        EncodedFrame {
            frame_id: self.id,
            data: self.data,
            key_frame: self.key_frame,
            arrival_time: arrival_time(self.timestamp),
        }
    }
}

impl FrameAssembler {
    /// Feed one chunk; returns the assembled frame when it is complete.
    /// A chunk that does not continue the in-flight frame drops that frame.
    fn push(&mut self, chunk: NetworkFrame) -> Option<EncodedFrame> {
        let id = FrameId::new(chunk.i.0, chunk.i.1);
        let payload = match chunk.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("dropping chunk of frame {id:?}: bad base64: {e}");
                if self.partial.as_ref().is_some_and(|p| p.id == id) {
                    self.partial = None;
                }
                return None;
            }
        };

        if chunk.chunks <= 1 {
            if let Some(partial) = self.partial.take() {
                log_gap(&partial, id);
            }
            return Some(EncodedFrame {
                frame_id: id,
                data: payload,
                key_frame: chunk.key_frame,
                arrival_time: arrival_time(chunk.timestamp),
            });
        }

        match self.partial.take() {
            Some(mut partial) if partial.id == id => {
                if chunk.chunk != partial.next_chunk {
                    log_gap(&partial, id);
                    return None;
                }
                partial.data.extend_from_slice(&payload);
                partial.next_chunk += 1;
                partial.key_frame |= chunk.key_frame;
                if chunk.chunk == partial.chunks {
                    return Some(partial.finish());
                }
                self.partial = Some(partial);
            }
            Some(partial) if id > partial.id => {
                log_gap(&partial, id);
                self.start(id, chunk, payload);
            }
            Some(partial) => {
                // Older than the in-flight frame: stale chunk, discard.
                self.partial = Some(partial);
            }
            None => self.start(id, chunk, payload),
        }
        None
    }

    fn start(&mut self, id: FrameId, chunk: NetworkFrame, payload: Vec<u8>) {
        if chunk.chunk != 1 {
            warn!("dropping mid-frame chunk {}/{} of {id:?}", chunk.chunk, chunk.chunks);
            return;
        }
        self.partial = Some(PartialFrame {
            id,
            next_chunk: 2,
            chunks: chunk.chunks,
            key_frame: chunk.key_frame,
            timestamp: chunk.timestamp,
            data: payload,
        });
    }
}

fn log_gap(partial: &PartialFrame, incoming: FrameId) {
    warn!(
        "dropping partial frame {:?} ({}/{} chunks) on arrival of {:?}",
        partial.id,
        partial.next_chunk - 1,
        partial.chunks,
        incoming
    );
    metrics::global().counter("bus_source_frames_dropped").increment();
}

fn arrival_time(timestamp: Option<f64>) -> SystemTime {
    match timestamp {
        Some(t) if t.is_finite() && t >= 0.0 => {
            SystemTime::UNIX_EPOCH + Duration::from_secs_f64(t)
        }
        _ => SystemTime::now(),
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    use super::*;

    fn chunk(i: (i64, i64), index: u32, total: u32, data: &[u8]) -> NetworkFrame {
        NetworkFrame {
            i,
            chunk: index,
            chunks: total,
            d: BASE64.encode(data),
            key_frame: false,
            timestamp: None,
        }
    }

    #[test]
    fn single_chunk_frames_pass_straight_through() {
        let mut assembler = FrameAssembler::default();
        let frame = assembler.push(chunk((1, 2), 1, 1, b"abc")).unwrap();
        assert_eq!(frame.frame_id, FrameId::new(1, 2));
        assert_eq!(frame.data, b"abc");
    }

    #[test]
    fn chunks_concatenate_in_arrival_order() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(chunk((5, 6), 1, 3, b"aa")).is_none());
        assert!(assembler.push(chunk((5, 6), 2, 3, b"bb")).is_none());
        let frame = assembler.push(chunk((5, 6), 3, 3, b"cc")).unwrap();
        assert_eq!(frame.frame_id, FrameId::new(5, 6));
        assert_eq!(frame.data, b"aabbcc");
    }

    #[test]
    fn newer_frame_drops_the_partial_and_starts_over() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(chunk((5, 6), 1, 3, b"aa")).is_none());
        // (5,7) arrives before (5,6) finished: the partial is abandoned.
        assert!(assembler.push(chunk((5, 7), 1, 2, b"xx")).is_none());
        let frame = assembler.push(chunk((5, 7), 2, 2, b"yy")).unwrap();
        assert_eq!(frame.frame_id, FrameId::new(5, 7));
        assert_eq!(frame.data, b"xxyy");
    }

    #[test]
    fn out_of_order_chunk_drops_the_frame() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(chunk((5, 6), 1, 3, b"aa")).is_none());
        assert!(assembler.push(chunk((5, 6), 3, 3, b"cc")).is_none());
        // The frame is gone; a fresh first chunk starts a new one.
        assert!(assembler.push(chunk((5, 6), 2, 3, b"bb")).is_none());
        assert!(assembler.push(chunk((6, 7), 1, 1, b"z")).is_some());
    }

    #[test]
    fn stale_chunk_of_an_older_frame_is_discarded() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(chunk((5, 6), 1, 2, b"aa")).is_none());
        assert!(assembler.push(chunk((3, 4), 2, 2, b"old")).is_none());
        let frame = assembler.push(chunk((5, 6), 2, 2, b"bb")).unwrap();
        assert_eq!(frame.data, b"aabb");
    }

    #[test]
    fn key_frame_flag_survives_assembly() {
        let mut assembler = FrameAssembler::default();
        let mut first = chunk((1, 2), 1, 2, b"aa");
        first.key_frame = true;
        assert!(assembler.push(first).is_none());
        let frame = assembler.push(chunk((1, 2), 2, 2, b"bb")).unwrap();
        assert!(frame.key_frame);
    }

    #[test]
    fn mid_frame_chunk_without_a_start_is_dropped() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(chunk((5, 6), 2, 3, b"bb")).is_none());
        assert!(assembler.partial.is_none());
    }

    mod end_to_end {
        use std::collections::HashMap;
        use std::time::Instant;

        use framebot_streams::{Subscriber, Subscription};
        use serde_json::json;

        use super::*;
        use crate::client::{
            BusClient, ClientFactory, PublishAck, StatusCallback, WeakObserver,
        };
        use crate::io::IoLoop;

        struct CaptureDelegate {
            subscriptions: Arc<Mutex<HashMap<String, WeakObserver>>>,
        }

        impl BusClient for CaptureDelegate {
            fn start(&mut self, _status: StatusCallback) -> crate::client::Result<()> {
                Ok(())
            }
            fn stop(&mut self) {}
            fn publish(&mut self, _channel: &str, _message: Value, ack: Option<PublishAck>) {
                if let Some(ack) = ack {
                    ack(Ok(()));
                }
            }
            fn subscribe(
                &mut self,
                _id: SubscriptionId,
                channel: &str,
                _options: SubscribeOptions,
                observer: WeakObserver,
            ) -> crate::client::Result<()> {
                self.subscriptions.lock().insert(channel.to_string(), observer);
                Ok(())
            }
            fn unsubscribe(&mut self, _id: SubscriptionId) {}
        }

        struct PacketSink {
            seen: Arc<Mutex<Vec<String>>>,
        }

        impl Subscriber<EncodedPacket> for PacketSink {
            fn on_subscribe(&mut self, subscription: Subscription) {
                subscription.request(100);
            }
            fn on_next(&mut self, packet: EncodedPacket) {
                let entry = match packet {
                    EncodedPacket::Params(p) => format!("params:{}", p.codec),
                    EncodedPacket::Frame(f) => {
                        format!("frame:{}:{}:{}", f.frame_id.i1, f.frame_id.i2, f.data.len())
                    }
                };
                self.seen.lock().push(entry);
            }
            fn on_complete(&mut self) {
                self.seen.lock().push("complete".into());
            }
            fn on_error(&mut self, error: StreamError) {
                self.seen.lock().push(format!("error:{error}"));
            }
        }

        fn inject(
            subscriptions: &Arc<Mutex<HashMap<String, WeakObserver>>>,
            channel: &str,
            message: Value,
        ) {
            let observer = subscriptions.lock().get(channel).cloned().expect("channel");
            observer.upgrade().expect("observer alive").lock().on_data(message);
        }

        fn wait_for<T: Clone>(
            state: &Arc<Mutex<T>>,
            pred: impl Fn(&T) -> bool,
        ) -> T {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                if pred(&state.lock()) {
                    return state.lock().clone();
                }
                assert!(Instant::now() < deadline, "condition never held");
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        #[test]
        fn emits_params_then_assembled_frames() {
            let subscriptions: Arc<Mutex<HashMap<String, WeakObserver>>> =
                Arc::new(Mutex::new(HashMap::new()));
            let factory_subscriptions = subscriptions.clone();
            let factory: ClientFactory = Box::new(move || {
                Ok(Box::new(CaptureDelegate {
                    subscriptions: factory_subscriptions.clone(),
                }))
            });
            let io = Arc::new(IoLoop::start());
            let client = ResilientClient::new(io, factory);
            client.start(Box::new(|e| panic!("fatal: {e}")));

            let publisher = bus_source(
                client.clone(),
                BusSourceChannels { metadata: "m".into(), frames: "f".into() },
                SubscribeOptions::default(),
            );
            let seen = Arc::new(Mutex::new(Vec::<String>::new()));
            let sink_seen = seen.clone();
            std::thread::spawn(move || {
                Box::new(publisher).subscribe(Box::new(PacketSink { seen: sink_seen }));
            });

            wait_for(&subscriptions, |s| s.len() == 2);

            // A frame before any metadata is discarded.
            inject(&subscriptions, "f", json!({"i": [1, 2], "d": BASE64.encode(b"zz")}));
            inject(&subscriptions, "m", json!({"codec": "h264"}));
            for (index, data) in [b"aa", b"bb", b"cc"].iter().enumerate() {
                inject(
                    &subscriptions,
                    "f",
                    json!({
                        "i": [5, 6],
                        "chunk": index as u32 + 1,
                        "chunks": 3,
                        "d": BASE64.encode(data),
                    }),
                );
            }

            let entries = wait_for(&seen, |s| s.len() >= 2);
            assert_eq!(entries, vec!["params:h264", "frame:5:6:6"]);

            // A repeat of identical metadata emits nothing; a change does.
            inject(&subscriptions, "m", json!({"codec": "h264"}));
            inject(&subscriptions, "m", json!({"codec": "vp9"}));
            let entries = wait_for(&seen, |s| s.len() >= 3);
            assert_eq!(entries[2], "params:vp9");
        }
    }
}
