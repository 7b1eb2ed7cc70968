// crates/framebot-media/src/lib.rs

pub mod container;
pub mod decode;
pub mod source;
pub mod transcode;
mod helpers; // internal — not pub, not re-exported

pub use container::{escape_channel, ContainerSink, ContainerWriter, MatroskaWriter};
pub use decode::{decode, StreamDecoder};
pub use source::{media_source, MediaOrigin};
pub use transcode::transcode_vp9;
