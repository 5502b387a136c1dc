use std::time::Duration;

use thiserror::Error;

use crate::audio::device::AudioError;
use crate::codec::CodecError;
use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, VoxError>;

#[derive(Error, Debug)]
pub enum VoxError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Protocol not ready: {0}")]
    NotReady(String),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
