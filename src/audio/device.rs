use thiserror::Error;

use crate::codec::FRAME_SIZE;

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Failed to write audio data: {0}")]
    Write(String),

    #[error("Stream not open: {0}")]
    NotOpen(String),
}

/// A fixed-duration block of raw PCM samples; the unit of capture and
/// playback.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn silence() -> Self {
        Self {
            samples: vec![0; FRAME_SIZE],
        }
    }
}

/// Duplex audio hardware seam: open/start/stop/read/write primitives over a
/// capture stream and a playback stream on one device.
///
/// Owned exclusively by the audio pipeline and driven from the scheduler
/// thread. `reinitialize_*` performs the full stop/close/reopen cycle and
/// leaves the stream running on success.
pub trait AudioDevice: Send {
    fn start_capture(&mut self) -> Result<(), AudioError>;
    fn stop_capture(&mut self) -> Result<(), AudioError>;
    fn reinitialize_capture(&mut self) -> Result<(), AudioError>;

    /// Pull the next captured frame if one is ready. Returns `Ok(None)` when
    /// no full frame has accumulated yet.
    fn read_frame(&mut self) -> Result<Option<AudioFrame>, AudioError>;

    fn start_playback(&mut self) -> Result<(), AudioError>;
    fn stop_playback(&mut self) -> Result<(), AudioError>;
    fn reinitialize_playback(&mut self) -> Result<(), AudioError>;

    /// Queue one contiguous PCM buffer for playback.
    fn write_pcm(&mut self, pcm: &[i16]) -> Result<(), AudioError>;

    /// Release both streams and the device handle.
    fn close(&mut self);
}
