// crates/framebot/src/runner.rs
//
// Drives a pipeline to its terminal signal on the calling thread and maps
// the outcome to a process exit code. Decode and bot work run behind a
// worker thread; SIGINT/SIGTERM/SIGQUIT break the stream for an orderly
// drain (the bot's shutdown burst still reaches the sink).

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use serde_json::Value;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use tracing::{error, info};

use framebot_bus::{BusMessageSink, ChannelNames, ResilientClient};
use framebot_core::{
    run_bot, BotDescriptor, BotInput, BotOptions, EncodedPacket, PixelFormat,
};
use framebot_media::{decode, transcode_vp9, ContainerSink, ContainerWriter};
use framebot_streams::{Publisher, PublisherExt, StreamError, Subscriber};

/// Signals that end a pipeline cleanly.
pub const SHUTDOWN_SIGNALS: [i32; 3] = [SIGINT, SIGTERM, SIGQUIT];

/// How long the terminal signal may lag behind the source shutting down
/// (it crosses the worker-thread queue).
const DRAIN_GRACE: Duration = Duration::from_secs(10);

pub struct BotPipelineOptions {
    pub bot_id: String,
    pub config: Option<Value>,
    pub pixel_format: PixelFormat,
    /// Outbound channels for analysis/debug/control messages.
    pub output: ChannelNames,
}

/// Run a bot over a stream of encoded packets until the source completes or
/// a shutdown signal arrives. Returns the process exit code.
pub fn run_bot_pipeline<S>(
    source: S,
    client: &ResilientClient,
    descriptor: BotDescriptor,
    options: BotPipelineOptions,
) -> i32
where
    S: Publisher<EncodedPacket> + 'static,
{
    let decoded = decode(source.threaded_worker("decode"), options.pixel_format);
    let inputs = decoded.map(|packet| BotInput::Batch(VecDeque::from([packet])));
    let outputs = run_bot(
        inputs,
        descriptor,
        BotOptions { bot_id: options.bot_id, config: options.config },
    );
    let pipeline = outputs.signal_breaker(&SHUTDOWN_SIGNALS);

    let (done_tx, done_rx) = bounded(1);
    let sink = BusMessageSink::new(client.clone(), options.output, done_tx);
    let code = drive(pipeline, Box::new(sink), done_rx);
    client.stop();
    code
}

/// Record a stream of encoded packets as VP9 into `writer` until the source
/// completes or a shutdown signal arrives. Returns the process exit code.
pub fn run_recorder_pipeline<S, W>(source: S, writer: W) -> i32
where
    S: Publisher<EncodedPacket> + 'static,
    W: ContainerWriter + 'static,
{
    let pipeline =
        transcode_vp9(source.threaded_worker("transcode")).signal_breaker(&SHUTDOWN_SIGNALS);

    let (done_tx, done_rx) = bounded(1);
    let sink = ContainerSink::new(writer, done_tx);
    drive(pipeline, Box::new(sink), done_rx)
}

/// Subscribe the sink and block until the stream's terminal outcome lands.
/// subscribe() itself pumps the source on this thread and returns when the
/// source side winds down; the terminal signal then arrives from the worker
/// thread through `done`.
fn drive<T, P>(
    pipeline: P,
    sink: Box<dyn Subscriber<T>>,
    done: Receiver<Result<(), StreamError>>,
) -> i32
where
    T: Send + 'static,
    P: Publisher<T> + 'static,
{
    Box::new(pipeline).subscribe(sink);
    match done.recv_timeout(DRAIN_GRACE) {
        Ok(Ok(())) => {
            info!("pipeline completed");
            0
        }
        Ok(Err(e)) => {
            error!("pipeline failed: {e}");
            1
        }
        Err(_) => {
            error!("pipeline did not report a terminal outcome");
            1
        }
    }
}
