// crates/framebot-core/src/position.rs
//
// Channel resume position, formatted as "<gen>:<pos>". Malformed input
// parses to the zero position rather than failing.

use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelPosition {
    pub generation: u32,
    pub position: u64,
}

impl ChannelPosition {
    pub fn new(generation: u32, position: u64) -> Self {
        Self { generation, position }
    }

    pub fn parse(input: &str) -> Self {
        let Some((generation, position)) = input.split_once(':') else {
            return Self::default();
        };
        match (generation.parse::<u32>(), position.parse::<u64>()) {
            (Ok(generation), Ok(position)) => Self { generation, position },
            _ => Self::default(),
        }
    }
}

impl fmt::Display for ChannelPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.generation, self.position)
    }
}
