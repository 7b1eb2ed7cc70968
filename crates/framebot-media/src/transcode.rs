// crates/framebot-media/src/transcode.rs
//
// VP9 transcode stage: decode whatever the source carries, re-encode as
// VP9, and re-emit encoded packets with ids and key flags preserved. Used
// by the recorder so the container always holds one codec.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tracing::warn;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::Pixel;
use ffmpeg::util::rational::Rational;

use framebot_core::{
    CodecParams, EncodedFrame, EncodedPacket, FrameId, ImagePacket, OwnedImageFrame, PixelFormat,
};
use framebot_streams::generators::stateful;
use framebot_streams::{concat, BoxPublisher, Publisher, PublisherExt};

use crate::decode::StreamDecoder;
use crate::helpers::frame_from_i420;

struct Vp9Transcoder {
    decoder: StreamDecoder,
    encoder: Option<ffmpeg::encoder::Video>,
    encoder_size: (u32, u32),
    frame_index: i64,
    pending_ids: VecDeque<FrameId>,
}

impl Vp9Transcoder {
    fn new() -> Self {
        Self {
            decoder: StreamDecoder::new(PixelFormat::I420),
            encoder: None,
            encoder_size: (0, 0),
            frame_index: 0,
            pending_ids: VecDeque::new(),
        }
    }

    fn process(&mut self, packet: EncodedPacket) -> Vec<EncodedPacket> {
        let images = self.decoder.process(packet);
        let mut out = Vec::new();
        for image in images {
            if let ImagePacket::Frame(frame) = image {
                self.encode(frame, &mut out);
            }
        }
        out
    }

    fn encode(&mut self, image: OwnedImageFrame, out: &mut Vec<EncodedPacket>) {
        let size = (image.width, image.height);
        if self.encoder.is_none() || self.encoder_size != size {
            match build_encoder(size) {
                Ok(built) => {
                    self.encoder = Some(built);
                    self.encoder_size = size;
                    self.pending_ids.clear();
                    out.push(EncodedPacket::Params(CodecParams {
                        codec: "vp9".into(),
                        extra_data: Vec::new(),
                        width: size.0,
                        height: size.1,
                    }));
                }
                Err(e) => {
                    warn!("vp9 encoder init failed, dropping frame: {e}");
                    return;
                }
            }
        }
        let Some(encoder) = self.encoder.as_mut() else { return };

        let mut frame = frame_from_i420(&image);
        frame.set_pts(Some(self.frame_index));
        self.frame_index += 1;

        if let Err(e) = encoder.send_frame(&frame) {
            warn!("vp9 encode failed for {:?}: {e}", image.frame_id);
            return;
        }
        self.pending_ids.push_back(image.frame_id);
        Self::receive_all(encoder, &mut self.pending_ids, out);
    }

    fn receive_all(
        encoder: &mut ffmpeg::encoder::Video,
        pending_ids: &mut VecDeque<FrameId>,
        out: &mut Vec<EncodedPacket>,
    ) {
        let mut packet = ffmpeg::Packet::empty();
        while encoder.receive_packet(&mut packet).is_ok() {
            let frame_id = pending_ids.pop_front().unwrap_or(FrameId::UNASSIGNED);
            out.push(EncodedPacket::Frame(EncodedFrame {
                frame_id,
                data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
                key_frame: packet.is_key(),
                arrival_time: SystemTime::now(),
            }));
        }
    }

    fn drain(&mut self) -> Vec<EncodedPacket> {
        let mut out = Vec::new();
        for image in self.decoder.drain() {
            if let ImagePacket::Frame(frame) = image {
                self.encode(frame, &mut out);
            }
        }
        if let Some(encoder) = self.encoder.as_mut() {
            let _ = encoder.send_eof();
            Self::receive_all(encoder, &mut self.pending_ids, &mut out);
        }
        out
    }
}

/// Low-latency VP9: one packet out per frame in, so frame ids stay paired.
fn build_encoder(size: (u32, u32)) -> Result<ffmpeg::encoder::Video> {
    let vp9 = encoder::find(CodecId::VP9).ok_or_else(|| anyhow!("VP9 encoder not found"))?;
    let ctx = codec::context::Context::new_with_codec(vp9);
    let mut video = ctx.encoder().video()?;
    video.set_width(size.0);
    video.set_height(size.1);
    video.set_format(Pixel::YUV420P);
    video.set_time_base(Rational::new(1, 1000));

    let mut opts = ffmpeg::Dictionary::new();
    opts.set("deadline", "realtime");
    opts.set("cpu-used", "8");
    opts.set("lag-in-frames", "0");

    Ok(video.open_as_with(vp9, opts)?)
}

/// Operator form over a stream of encoded packets.
pub fn transcode_vp9<P>(upstream: P) -> impl Publisher<EncodedPacket>
where
    P: Publisher<EncodedPacket> + 'static,
{
    let transcoder = Arc::new(Mutex::new(Vp9Transcoder::new()));

    let main = {
        let transcoder = transcoder.clone();
        upstream
            .map(move |packet| {
                let packets = transcoder.lock().process(packet);
                Box::new(framebot_streams::publishers::of(packets)) as BoxPublisher<EncodedPacket>
            })
            .flatten()
    };

    let eof_drain = stateful(
        move || transcoder.lock().drain().into_iter(),
        |drained, sink| match drained.next() {
            Some(packet) => sink.on_next(packet),
            None => sink.on_complete(),
        },
    );

    concat(main, eof_drain)
}
