// crates/framebot-core/src/lib.rs

pub mod bot;
pub mod frame;
pub mod messages;
pub mod metrics;
pub mod position;

pub use bot::{run_bot, BotContext, BotDescriptor, BotOptions};
pub use frame::{
    CodecParams, EncodedFrame, EncodedPacket, FrameId, ImageMetadata, ImagePacket,
    OwnedImageFrame, PixelFormat,
};
pub use messages::{BotInput, BotMessage, BotOutput, MessageKind};
pub use position::ChannelPosition;
