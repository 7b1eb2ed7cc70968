// crates/framebot-media/src/source.rs
//
// File / URL / camera origins: demux with FFmpeg and publish codec
// parameters followed by encoded frames. Frame ids are synthesized as a
// running packet sequence.

use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{anyhow, Context as _, Result};
use tracing::warn;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::media::Type;

use framebot_core::{CodecParams, EncodedFrame, EncodedPacket, FrameId};
use framebot_streams::generators::{stateful, GeneratorSink};
use framebot_streams::{Publisher, StreamError};

#[derive(Clone, Debug)]
pub enum MediaOrigin {
    File(PathBuf),
    Url(String),
    /// Capture device, addressed the way FFmpeg expects for the platform,
    /// with demuxer options (frame rate, video size, ...).
    Camera { device: String, options: Vec<(String, String)> },
}

impl MediaOrigin {
    fn describe(&self) -> String {
        match self {
            MediaOrigin::File(path) => path.display().to_string(),
            MediaOrigin::Url(url) => url.clone(),
            MediaOrigin::Camera { device, .. } => device.clone(),
        }
    }
}

/// Publisher of encoded packets demuxed from `origin`. The origin is opened
/// lazily on first demand; open failure fails the stream.
pub fn media_source(origin: MediaOrigin) -> impl Publisher<EncodedPacket> {
    stateful(
        move || SourceState::open(&origin),
        |state, sink| state.pump(sink),
    )
}

struct SourceState {
    opened: Option<Opened>,
    open_error: Option<String>,
}

struct Opened {
    ictx: ffmpeg::format::context::Input,
    video_index: usize,
    /// Emitted once, before the first frame.
    params: Option<CodecParams>,
    next_seq: i64,
}

impl SourceState {
    fn open(origin: &MediaOrigin) -> Self {
        match Opened::open(origin) {
            Ok(opened) => Self { opened: Some(opened), open_error: None },
            Err(e) => {
                warn!("opening {}: {e:#}", origin.describe());
                Self { opened: None, open_error: Some(format!("{e:#}")) }
            }
        }
    }

    fn pump(&mut self, sink: &mut GeneratorSink<EncodedPacket>) {
        if let Some(message) = self.open_error.take() {
            sink.on_error(StreamError::Transport(message));
            return;
        }
        let Some(opened) = self.opened.as_mut() else {
            sink.on_complete();
            return;
        };

        if let Some(params) = opened.params.take() {
            sink.on_next(EncodedPacket::Params(params));
            return;
        }

        for result in opened.ictx.packets() {
            let (stream, packet) = match result {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("demux error, skipping packet: {e}");
                    continue;
                }
            };
            if stream.index() != opened.video_index {
                continue;
            }
            let seq = opened.next_seq;
            opened.next_seq += 1;
            sink.on_next(EncodedPacket::Frame(EncodedFrame {
                frame_id: FrameId::new(seq, seq + 1),
                data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
                key_frame: packet.is_key(),
                arrival_time: SystemTime::now(),
            }));
            return;
        }

        sink.on_complete();
    }
}

impl Opened {
    fn open(origin: &MediaOrigin) -> Result<Self> {
        let ictx = match origin {
            MediaOrigin::File(path) => {
                ffmpeg::format::input(path).with_context(|| format!("open {}", path.display()))?
            }
            MediaOrigin::Url(url) => {
                ffmpeg::format::input(&url).with_context(|| format!("open {url}"))?
            }
            MediaOrigin::Camera { device, options } => {
                let mut dictionary = ffmpeg::Dictionary::new();
                for (key, value) in options {
                    dictionary.set(key, value);
                }
                ffmpeg::format::input_with_dictionary(&device, dictionary)
                    .with_context(|| format!("open capture device {device}"))?
            }
        };

        // Scoped so the stream borrow ends before ictx moves into Self.
        let (video_index, params) = {
            let stream = ictx
                .streams()
                .best(Type::Video)
                .ok_or_else(|| anyhow!("no video stream in {}", origin.describe()))?;
            let parameters = stream.parameters();

            let codec = ffmpeg::decoder::find(parameters.id())
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "unknown".to_string());

            // Extradata has no safe accessor in this version of
            // ffmpeg-the-third.
            let extra_data = unsafe {
                let raw = parameters.as_ptr();
                if (*raw).extradata.is_null() || (*raw).extradata_size <= 0 {
                    Vec::new()
                } else {
                    std::slice::from_raw_parts((*raw).extradata, (*raw).extradata_size as usize)
                        .to_vec()
                }
            };

            let params = CodecParams {
                codec,
                extra_data,
                width: parameters.width() as u32,
                height: parameters.height() as u32,
            };
            (stream.index(), params)
        };

        Ok(Self { ictx, video_index, params: Some(params), next_seq: 0 })
    }
}
