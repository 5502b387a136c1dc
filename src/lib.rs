//! voxbridge: edge client bridging a microphone/speaker device to a cloud
//! voice backend.
//!
//! The conversation loop lives in [`engine`]; audio capture/playback in
//! [`audio`] and [`codec`]; the server transports in [`protocol`].

pub mod audio;
pub mod codec;
pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod state;
pub mod supervisor;
pub mod wakeword;

pub use error::{Result, VoxError};
