// crates/framebot/src/lib.rs
//
// Pipeline wiring for the two program variants: the bot runner (decode,
// dispatch to the user callbacks, publish messages back to the bus) and the
// recorder (transcode to VP9, write a container file). Both share the same
// source, streams runtime, and shutdown path.

pub mod runner;

pub use runner::{run_bot_pipeline, run_recorder_pipeline, BotPipelineOptions, SHUTDOWN_SIGNALS};
