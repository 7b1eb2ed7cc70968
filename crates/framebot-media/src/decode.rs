// crates/framebot-media/src/decode.rs
//
// Decoder stage: encoded packets in, image packets out. Codec parameters
// (re)build the decoder context; frames are fed through FFmpeg and scaled
// to the requested pixel format. A decode failure drops that frame and the
// stream carries on; upstream EOF drains the decoder first.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};

use framebot_core::{
    metrics, CodecParams, EncodedFrame, EncodedPacket, FrameId, ImageMetadata, ImagePacket,
    OwnedImageFrame, PixelFormat,
};
use framebot_streams::generators::stateful;
use framebot_streams::{concat, BoxPublisher, Publisher, PublisherExt};

use crate::helpers::{extract_planes, pixel_of, set_extradata};

/// Stateful decoder front-end. Owns the FFmpeg decoder context, the scaler,
/// and the queue pairing input frame ids with decoder output.
pub struct StreamDecoder {
    target: PixelFormat,
    decoder: Option<ffmpeg::decoder::Video>,
    scaler: Option<SwsContext>,
    pending_ids: VecDeque<FrameId>,
    emitted_metadata: Option<ImageMetadata>,
}

impl StreamDecoder {
    pub fn new(target: PixelFormat) -> Self {
        Self {
            target,
            decoder: None,
            scaler: None,
            pending_ids: VecDeque::new(),
            emitted_metadata: None,
        }
    }

    pub fn process(&mut self, packet: EncodedPacket) -> Vec<ImagePacket> {
        match packet {
            EncodedPacket::Params(params) => {
                if let Err(e) = self.reinit(&params) {
                    warn!(codec = %params.codec, "decoder init failed: {e}");
                }
                Vec::new()
            }
            EncodedPacket::Frame(frame) => self.decode_frame(frame),
        }
    }

    /// Tear down and rebuild for new codec parameters. Pending partial
    /// output is discarded.
    fn reinit(&mut self, params: &CodecParams) -> Result<()> {
        self.decoder = None;
        self.scaler = None;
        self.pending_ids.clear();

        let codec = ffmpeg::decoder::find_by_name(&params.codec)
            .ok_or_else(|| anyhow!("no decoder named '{}'", params.codec))?;
        let mut ctx = ffmpeg::codec::context::Context::new_with_codec(codec);
        set_extradata(&mut ctx, &params.extra_data);
        self.decoder = Some(ctx.decoder().video()?);
        debug!(codec = %params.codec, "decoder (re)initialized");
        Ok(())
    }

    fn decode_frame(&mut self, frame: EncodedFrame) -> Vec<ImagePacket> {
        let Some(decoder) = self.decoder.as_mut() else {
            warn!("dropping frame {:?}: no decoder configured", frame.frame_id);
            metrics::global().counter("decode_frames_dropped").increment();
            return Vec::new();
        };

        let mut packet = ffmpeg::Packet::copy(&frame.data);
        if frame.key_frame {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        if let Err(e) = decoder.send_packet(&packet) {
            warn!("undecodable frame {:?} dropped: {e}", frame.frame_id);
            metrics::global().counter("decode_frames_dropped").increment();
            return Vec::new();
        }
        self.pending_ids.push_back(frame.frame_id);
        self.receive_all()
    }

    /// Pull every decoded frame currently available and convert it.
    fn receive_all(&mut self) -> Vec<ImagePacket> {
        let mut out = Vec::new();
        let Some(decoder) = self.decoder.as_mut() else { return out };

        let mut decoded = ffmpeg::util::frame::video::Video::empty();
        while decoder.receive_frame(&mut decoded).is_ok() {
            let frame_id = self.pending_ids.pop_front().unwrap_or(FrameId::UNASSIGNED);

            if self.scaler.is_none() {
                let built = SwsContext::get(
                    decoded.format(),
                    decoded.width(),
                    decoded.height(),
                    pixel_of(self.target),
                    decoded.width(),
                    decoded.height(),
                    Flags::BILINEAR,
                );
                match built {
                    Ok(scaler) => self.scaler = Some(scaler),
                    Err(e) => {
                        warn!("scaler init failed, dropping frame {frame_id:?}: {e}");
                        continue;
                    }
                }
            }
            let Some(scaler) = self.scaler.as_mut() else { continue };

            let mut converted = ffmpeg::util::frame::video::Video::empty();
            if let Err(e) = scaler.run(&decoded, &mut converted) {
                warn!("pixel conversion failed, dropping frame {frame_id:?}: {e}");
                metrics::global().counter("decode_frames_dropped").increment();
                continue;
            }

            let (plane_strides, plane_data) = extract_planes(&converted, self.target);
            let image = OwnedImageFrame {
                frame_id,
                width: decoded.width(),
                height: decoded.height(),
                plane_strides,
                plane_data,
            };

            let metadata = ImageMetadata {
                width: image.width,
                height: image.height,
                plane_strides,
                pixel_format: self.target,
            };
            if self.emitted_metadata.as_ref() != Some(&metadata) {
                self.emitted_metadata = Some(metadata);
                out.push(ImagePacket::Metadata(metadata));
            }

            metrics::global().counter("decode_frames").increment();
            out.push(ImagePacket::Frame(image));
        }
        out
    }

    /// EOF: flush buffered frames out of the decoder.
    pub fn drain(&mut self) -> Vec<ImagePacket> {
        if let Some(decoder) = self.decoder.as_mut() {
            let _ = decoder.send_eof();
        }
        self.receive_all()
    }
}

/// Operator form: a publisher of encoded packets becomes a publisher of
/// image packets, draining the decoder when the upstream completes.
pub fn decode<P>(upstream: P, target: PixelFormat) -> impl Publisher<ImagePacket>
where
    P: Publisher<EncodedPacket> + 'static,
{
    let decoder = Arc::new(Mutex::new(StreamDecoder::new(target)));

    let main = {
        let decoder = decoder.clone();
        upstream
            .map(move |packet| {
                let packets = decoder.lock().process(packet);
                Box::new(framebot_streams::publishers::of(packets)) as BoxPublisher<ImagePacket>
            })
            .flatten()
    };

    let eof_drain = stateful(
        move || decoder.lock().drain().into_iter(),
        |drained, sink| match drained.next() {
            Some(packet) => sink.on_next(packet),
            None => sink.on_complete(),
        },
    );

    concat(main, eof_drain)
}
