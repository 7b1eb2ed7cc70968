// crates/framebot-core/src/messages.rs
//
// Bot-facing input/output sum types.

use std::collections::VecDeque;

use serde_json::Value;

use crate::frame::{FrameId, ImagePacket, OwnedImageFrame};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Analysis,
    Debug,
    Control,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Analysis => "analysis",
            MessageKind::Debug => "debug",
            MessageKind::Control => "control",
        }
    }
}

/// Outbound message queued by the bot, stamped with its frame context and
/// bot identity when drained.
#[derive(Clone, Debug, PartialEq)]
pub struct BotMessage {
    pub kind: MessageKind,
    pub data: Value,
    pub frame_id: FrameId,
}

/// What the bot instance consumes: a contiguous batch of image packets, or
/// a control message addressed by bot id.
#[derive(Debug)]
pub enum BotInput {
    Batch(VecDeque<ImagePacket>),
    Control(Value),
}

/// What the bot instance emits downstream.
#[derive(Debug)]
pub enum BotOutput {
    Frame(OwnedImageFrame),
    Message(BotMessage),
}
