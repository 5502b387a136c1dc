//! Opus frame transform. One fixed-duration PCM frame in, one opaque packet
//! out, and back again; everything inside the codec is treated as opaque by
//! the rest of the pipeline.

use std::time::Duration;

use thiserror::Error;

pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u16 = 1;
pub const FRAME_DURATION: Duration = Duration::from_millis(60);
/// Samples per frame: 60 ms of mono audio at 16 kHz.
pub const FRAME_SIZE: usize = 960;
/// Upper bound handed to the encoder for one compressed frame.
const MAX_PACKET_SIZE: usize = 4000;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Codec initialization failed: {0}")]
    Init(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Invalid frame length: expected {FRAME_SIZE} samples, got {0}")]
    InvalidFrame(usize),
}

/// Fixed-frame audio codec. Implementations keep their own encoder/decoder
/// state and are driven from the scheduler thread only.
pub trait AudioCodec: Send {
    /// Compress one frame of [`FRAME_SIZE`] PCM samples.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;

    /// Decompress one packet back into PCM samples.
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError>;
}

pub struct OpusCodec {
    encoder: opus::Encoder,
    decoder: opus::Decoder,
}

impl OpusCodec {
    pub fn new() -> Result<Self, CodecError> {
        let encoder = opus::Encoder::new(
            SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Audio,
        )
        .map_err(|e| CodecError::Init(e.to_string()))?;
        let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| CodecError::Init(e.to_string()))?;
        Ok(Self { encoder, decoder })
    }
}

impl AudioCodec for OpusCodec {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        if pcm.len() != FRAME_SIZE {
            return Err(CodecError::InvalidFrame(pcm.len()));
        }
        self.encoder
            .encode_vec(pcm, MAX_PACKET_SIZE)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        let mut pcm = vec![0i16; FRAME_SIZE];
        let decoded = self
            .decoder
            .decode(packet, &mut pcm, false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        pcm.truncate(decoded);
        Ok(pcm)
    }
}
