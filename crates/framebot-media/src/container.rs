// crates/framebot-media/src/container.rs
//
// Recorder sink: encoded packets land in a container file. The writer
// behind the trait decides the on-disk mapping; the FFmpeg matroska
// implementation keys packet timing off arrival times.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{anyhow, Context as _, Result};
use crossbeam_channel::Sender;
use tracing::warn;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::util::rational::Rational;

use framebot_core::{CodecParams, EncodedFrame, EncodedPacket};
use framebot_streams::{StreamError, Subscriber, Subscription};

/// Container file names derived from channel names must stay path-safe.
pub fn escape_channel(channel: &str) -> String {
    channel.replace('/', "{slash}")
}

/// Where recorded packets go. Frame id, key flag, and arrival time reach
/// the writer unmodified; each implementation maps them as its format
/// allows.
pub trait ContainerWriter: Send {
    /// First call sets up the stream and writes the file header. A mid-file
    /// parameter change is reported but not re-negotiated.
    fn write_params(&mut self, params: &CodecParams) -> Result<()>;
    fn write_frame(&mut self, frame: &EncodedFrame) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

// ── FFmpeg matroska writer ────────────────────────────────────────────────────

pub struct MatroskaWriter {
    path: PathBuf,
    octx: ffmpeg::format::context::Output,
    header_written: bool,
    first_arrival: Option<SystemTime>,
}

impl MatroskaWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let octx = ffmpeg::format::output_as(&path, "matroska")
            .with_context(|| format!("create container {}", path.display()))?;
        Ok(Self { path, octx, header_written: false, first_arrival: None })
    }

    fn millis_since_start(&mut self, arrival: SystemTime) -> i64 {
        let first = *self.first_arrival.get_or_insert(arrival);
        arrival
            .duration_since(first)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0)
    }
}

impl ContainerWriter for MatroskaWriter {
    fn write_params(&mut self, params: &CodecParams) -> Result<()> {
        if self.header_written {
            warn!(
                "codec parameters changed mid-file in {}; keeping original header",
                self.path.display()
            );
            return Ok(());
        }

        let codec_id = ffmpeg::decoder::find_by_name(&params.codec)
            .map(|codec| codec.id())
            .ok_or_else(|| anyhow!("unknown codec '{}'", params.codec))?;
        let codec = ffmpeg::encoder::find(codec_id)
            .or_else(|| ffmpeg::decoder::find(codec_id))
            .ok_or_else(|| anyhow!("no codec entry for '{}'", params.codec))?;

        let mut stream = self.octx.add_stream(codec).context("add video stream")?;
        stream.set_time_base(Rational::new(1, 1000));

        // No codecpar setters exist in this version of ffmpeg-the-third;
        // fill the muxer's parameters through the raw struct.
        unsafe {
            let par = (**(*self.octx.as_mut_ptr()).streams.add(0)).codecpar;
            (*par).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*par).codec_id = codec_id.into();
            (*par).width = params.width as i32;
            (*par).height = params.height as i32;
            if !params.extra_data.is_empty() {
                let size = params.extra_data.len();
                let buf = ffmpeg::ffi::av_mallocz(
                    size + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize,
                ) as *mut u8;
                if !buf.is_null() {
                    std::ptr::copy_nonoverlapping(params.extra_data.as_ptr(), buf, size);
                    (*par).extradata = buf;
                    (*par).extradata_size = size as i32;
                }
            }
        }

        self.octx.write_header().context("write container header")?;
        self.header_written = true;
        Ok(())
    }

    fn write_frame(&mut self, frame: &EncodedFrame) -> Result<()> {
        if !self.header_written {
            warn!("dropping frame {:?}: no codec parameters seen yet", frame.frame_id);
            return Ok(());
        }
        let pts = self.millis_since_start(frame.arrival_time);
        let mut packet = ffmpeg::Packet::copy(&frame.data);
        packet.set_stream(0);
        packet.set_pts(Some(pts));
        packet.set_dts(Some(pts));
        if frame.key_frame {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        packet
            .write_interleaved(&mut self.octx)
            .context("write container packet")
    }

    fn finish(&mut self) -> Result<()> {
        if !self.header_written {
            return Ok(());
        }
        self.octx.write_trailer().context("write container trailer")
    }
}

// ── Stream terminal ───────────────────────────────────────────────────────────

/// Subscriber feeding a container writer. A write failure cancels the
/// stream; the pipeline outcome is reported once through `done`.
pub struct ContainerSink<W: ContainerWriter> {
    writer: W,
    done: Sender<Result<(), StreamError>>,
    subscription: Option<Subscription>,
    terminated: bool,
}

impl<W: ContainerWriter> ContainerSink<W> {
    pub fn new(writer: W, done: Sender<Result<(), StreamError>>) -> Self {
        Self { writer, done, subscription: None, terminated: false }
    }

    fn fail(&mut self, error: anyhow::Error) {
        self.terminated = true;
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        let _ = self.done.send(Err(StreamError::Other(format!("{error:#}"))));
    }
}

impl<W: ContainerWriter + 'static> Subscriber<EncodedPacket> for ContainerSink<W> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        subscription.request(1);
        self.subscription = Some(subscription);
    }

    fn on_next(&mut self, packet: EncodedPacket) {
        if self.terminated {
            return;
        }
        let outcome = match &packet {
            EncodedPacket::Params(params) => self.writer.write_params(params),
            EncodedPacket::Frame(frame) => self.writer.write_frame(frame),
        };
        if let Err(e) = outcome {
            self.fail(e);
            return;
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
        let result = self.writer.finish().map_err(|e| StreamError::Other(format!("{e:#}")));
        let _ = self.done.send(result);
    }

    fn on_error(&mut self, error: StreamError) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        let _ = self.writer.finish();
        let _ = self.done.send(Err(error));
    }
}
