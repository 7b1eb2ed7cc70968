// crates/framebot-media/src/helpers.rs
//
// FFmpeg glue shared by the decode/transcode stages: pixel-format mapping,
// stride-aware plane extraction, and codec-context extradata installation.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::util::frame::video::Video as VideoFrame;

use framebot_core::{OwnedImageFrame, PixelFormat, MAX_IMAGE_PLANES};

pub(crate) fn pixel_of(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Rgb0 => Pixel::RGB0,
        PixelFormat::Bgr => Pixel::BGR24,
        PixelFormat::I420 => Pixel::YUV420P,
    }
}

pub(crate) fn plane_count(format: PixelFormat) -> usize {
    match format {
        PixelFormat::Rgb0 | PixelFormat::Bgr => 1,
        PixelFormat::I420 => 3,
    }
}

/// Copy the planes of a converted frame into owned buffers, stride intact.
pub(crate) fn extract_planes(
    frame: &VideoFrame,
    format: PixelFormat,
) -> ([u32; MAX_IMAGE_PLANES], [Vec<u8>; MAX_IMAGE_PLANES]) {
    let mut strides = [0u32; MAX_IMAGE_PLANES];
    let mut planes: [Vec<u8>; MAX_IMAGE_PLANES] = Default::default();
    for plane in 0..plane_count(format) {
        strides[plane] = frame.stride(plane) as u32;
        planes[plane] = frame.data(plane).to_vec();
    }
    (strides, planes)
}

/// Rebuild an FFmpeg frame from owned I420 planes, for re-encoding.
pub(crate) fn frame_from_i420(image: &OwnedImageFrame) -> VideoFrame {
    let mut frame = VideoFrame::new(Pixel::YUV420P, image.width, image.height);
    for plane in 0..3 {
        let src_stride = image.plane_strides[plane] as usize;
        let dst_stride = frame.stride(plane);
        let rows = if plane == 0 {
            image.height as usize
        } else {
            (image.height as usize).div_ceil(2)
        };
        let row_bytes = if plane == 0 {
            image.width as usize
        } else {
            (image.width as usize).div_ceil(2)
        };
        let src = &image.plane_data[plane];
        let dst = frame.data_mut(plane);
        for row in 0..rows {
            let s = row * src_stride;
            let d = row * dst_stride;
            dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
        }
    }
    frame
}

/// Install codec-private extra data on an unopened codec context. FFmpeg
/// frees it with the context; the buffer must be av_malloc'd and padded.
pub(crate) fn set_extradata(ctx: &mut ffmpeg::codec::context::Context, extra_data: &[u8]) {
    if extra_data.is_empty() {
        return;
    }
    unsafe {
        let raw = ctx.as_mut_ptr();
        let size = extra_data.len();
        let buf = ffmpeg::ffi::av_mallocz(size + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize)
            as *mut u8;
        if buf.is_null() {
            return;
        }
        std::ptr::copy_nonoverlapping(extra_data.as_ptr(), buf, size);
        (*raw).extradata = buf;
        (*raw).extradata_size = size as i32;
    }
}
