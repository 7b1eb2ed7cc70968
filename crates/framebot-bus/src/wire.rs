// crates/framebot-bus/src/wire.rs
//
// Inbound wire shapes for the metadata and frames channels.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stream metadata message: codec name plus codec-private data. Any field
/// change counts as a codec-parameter change.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetadata {
    pub codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extra_data_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<Value>,
}

impl NetworkMetadata {
    pub fn extra_data(&self) -> Result<Vec<u8>, base64::DecodeError> {
        if self.extra_data_base64.is_empty() {
            return Ok(Vec::new());
        }
        BASE64.decode(&self.extra_data_base64)
    }
}

/// One chunk of an encoded frame. Single-frame messages carry
/// `chunk == chunks == 1`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkFrame {
    /// Frame id as an `[i1, i2]` pair.
    pub i: (i64, i64),
    #[serde(default = "default_chunk")]
    pub chunk: u32,
    #[serde(default = "default_chunk")]
    pub chunks: u32,
    /// Base64 frame bytes.
    pub d: String,
    #[serde(default, rename = "key")]
    pub key_frame: bool,
    /// Producer timestamp, seconds since the epoch.
    #[serde(default, rename = "t", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

fn default_chunk() -> u32 {
    1
}

impl NetworkFrame {
    pub fn payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_parses_with_defaults() {
        let frame: NetworkFrame =
            serde_json::from_value(serde_json::json!({"i": [5, 6], "d": "AQID"})).unwrap();
        assert_eq!(frame.i, (5, 6));
        assert_eq!(frame.chunk, 1);
        assert_eq!(frame.chunks, 1);
        assert!(!frame.key_frame);
        assert_eq!(frame.payload().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn metadata_change_detection_covers_every_field() {
        let base: NetworkMetadata =
            serde_json::from_value(serde_json::json!({"codec": "h264"})).unwrap();
        let mut other = base.clone();
        assert_eq!(base, other);
        other.extra_data_base64 = "AQID".into();
        assert_ne!(base, other);
    }

    #[test]
    fn metadata_extra_data_decodes() {
        let metadata = NetworkMetadata {
            codec: "vp9".into(),
            extra_data_base64: BASE64.encode([9u8, 8, 7]),
            ..Default::default()
        };
        assert_eq!(metadata.extra_data().unwrap(), vec![9, 8, 7]);
    }
}
