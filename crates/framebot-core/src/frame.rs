// crates/framebot-core/src/frame.rs
//
// Frame and packet types that flow between pipeline stages. No FFmpeg, no
// bus wire formats — just owned data.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

pub const MAX_IMAGE_PLANES: usize = 4;

/// Half-open interval of packet sequence numbers composing one frame.
/// `(0,0)` means unassigned; a negative `i1` marks a synthetic id with no
/// frame context (such messages are published without a frame reference).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(i64, i64)", into = "(i64, i64)")]
pub struct FrameId {
    pub i1: i64,
    pub i2: i64,
}

impl FrameId {
    pub const UNASSIGNED: FrameId = FrameId { i1: 0, i2: 0 };

    pub fn new(i1: i64, i2: i64) -> Self {
        Self { i1, i2 }
    }

    pub fn is_unassigned(&self) -> bool {
        self.i1 == 0 && self.i2 == 0
    }

    pub fn is_synthetic(&self) -> bool {
        self.i1 < 0
    }
}

impl From<(i64, i64)> for FrameId {
    fn from((i1, i2): (i64, i64)) -> Self {
        Self { i1, i2 }
    }
}

impl From<FrameId> for (i64, i64) {
    fn from(id: FrameId) -> Self {
        (id.i1, id.i2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed RGB with a padding byte, one plane.
    Rgb0,
    /// Packed BGR, one plane.
    Bgr,
    /// Planar YUV 4:2:0, three planes.
    I420,
}

/// Geometry of the decoded stream. Latched by the first frame of a live
/// pipeline; a later frame with different geometry is a contract violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub plane_strides: [u32; MAX_IMAGE_PLANES],
    pub pixel_format: PixelFormat,
}

/// One decoded frame. Plane buffers are owned and move with the frame;
/// unused planes are empty.
#[derive(Debug)]
pub struct OwnedImageFrame {
    pub frame_id: FrameId,
    pub width: u32,
    pub height: u32,
    pub plane_strides: [u32; MAX_IMAGE_PLANES],
    pub plane_data: [Vec<u8>; MAX_IMAGE_PLANES],
}

/// Decoder stage output: stream geometry or a decoded frame.
#[derive(Debug)]
pub enum ImagePacket {
    Metadata(ImageMetadata),
    Frame(OwnedImageFrame),
}

/// Decoder-init payload: codec name plus codec-private extra data. The
/// coded dimensions are carried when the origin knows them (0 = unknown).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecParams {
    pub codec: String,
    pub extra_data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// One compressed frame as produced by a source.
#[derive(Debug)]
pub struct EncodedFrame {
    pub frame_id: FrameId,
    pub data: Vec<u8>,
    pub key_frame: bool,
    pub arrival_time: SystemTime,
}

/// Source output: codec parameters announce a stream (or a parameter
/// change); frames follow.
#[derive(Debug)]
pub enum EncodedPacket {
    Params(CodecParams),
    Frame(EncodedFrame),
}
