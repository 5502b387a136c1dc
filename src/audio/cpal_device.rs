//! cpal-backed duplex device.
//!
//! cpal streams are not `Send`, so a dedicated audio thread owns both the
//! capture and playback streams and everything else talks to it over a
//! command channel. Captured frames flow back over a bounded channel that
//! drops on overflow rather than stalling the device callback.

use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};

use super::device::{AudioDevice, AudioError, AudioFrame};
use crate::codec::{FRAME_SIZE, SAMPLE_RATE};

/// Maximum queued playback audio before writes are refused (~45 s at 16 kHz).
const MAX_PLAYBACK_SAMPLES: usize = 45 * SAMPLE_RATE as usize;
/// Captured frames buffered before the oldest are dropped.
const FRAME_CHANNEL_CAPACITY: usize = 32;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct CpalDeviceConfig {
    /// Capture device name (None = system default input).
    pub input_device: Option<String>,
    /// Playback device name (None = system default output).
    pub output_device: Option<String>,
}

type Reply = std::sync::mpsc::Sender<Result<(), AudioError>>;

enum DeviceCommand {
    StartCapture(Reply),
    StopCapture(Reply),
    ReinitCapture(Reply),
    StartPlayback(Reply),
    StopPlayback(Reply),
    ReinitPlayback(Reply),
    Write(Vec<i16>, Reply),
    Close,
}

pub struct CpalDuplexDevice {
    commands: Sender<DeviceCommand>,
    frames: Receiver<AudioFrame>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CpalDuplexDevice {
    pub fn new(config: CpalDeviceConfig) -> Result<Self, AudioError> {
        let (command_tx, command_rx) = std::sync::mpsc::channel();
        let (frame_tx, frame_rx) = sync_channel(FRAME_CHANNEL_CAPACITY);

        let worker = thread::Builder::new()
            .name("vox-audio".into())
            .spawn(move || audio_worker(config, command_rx, frame_tx))
            .map_err(|e| AudioError::Device(format!("audio thread spawn failed: {e}")))?;

        Ok(Self {
            commands: command_tx,
            frames: frame_rx,
            worker: Some(worker),
        })
    }

    fn roundtrip(
        &self,
        make: impl FnOnce(Reply) -> DeviceCommand,
    ) -> Result<(), AudioError> {
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        self.commands
            .send(make(reply_tx))
            .map_err(|_| AudioError::Device("audio thread has exited".into()))?;
        reply_rx
            .recv_timeout(COMMAND_TIMEOUT)
            .map_err(|_| AudioError::Device("audio thread did not respond".into()))?
    }
}

impl AudioDevice for CpalDuplexDevice {
    fn start_capture(&mut self) -> Result<(), AudioError> {
        self.roundtrip(DeviceCommand::StartCapture)
    }

    fn stop_capture(&mut self) -> Result<(), AudioError> {
        self.roundtrip(DeviceCommand::StopCapture)
    }

    fn reinitialize_capture(&mut self) -> Result<(), AudioError> {
        self.roundtrip(DeviceCommand::ReinitCapture)
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>, AudioError> {
        match self.frames.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(std::sync::mpsc::TryRecvError::Empty) => Ok(None),
            Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                Err(AudioError::Device("audio thread has exited".into()))
            }
        }
    }

    fn start_playback(&mut self) -> Result<(), AudioError> {
        self.roundtrip(DeviceCommand::StartPlayback)
    }

    fn stop_playback(&mut self) -> Result<(), AudioError> {
        self.roundtrip(DeviceCommand::StopPlayback)
    }

    fn reinitialize_playback(&mut self) -> Result<(), AudioError> {
        self.roundtrip(DeviceCommand::ReinitPlayback)
    }

    fn write_pcm(&mut self, pcm: &[i16]) -> Result<(), AudioError> {
        self.roundtrip(|reply| DeviceCommand::Write(pcm.to_vec(), reply))
    }

    fn close(&mut self) {
        let _ = self.commands.send(DeviceCommand::Close);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CpalDuplexDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// State owned by the audio thread. Streams are built lazily on first start
/// so that constructing the device never fails on machines without audio
/// hardware; errors surface when a stream is actually needed.
struct WorkerState {
    config: CpalDeviceConfig,
    capture: Option<Stream>,
    playback: Option<Stream>,
    playback_buffer: Arc<Mutex<VecDeque<i16>>>,
    frame_tx: SyncSender<AudioFrame>,
}

fn audio_worker(
    config: CpalDeviceConfig,
    commands: std::sync::mpsc::Receiver<DeviceCommand>,
    frame_tx: SyncSender<AudioFrame>,
) {
    let mut state = WorkerState {
        config,
        capture: None,
        playback: None,
        playback_buffer: Arc::new(Mutex::new(VecDeque::new())),
        frame_tx,
    };

    while let Ok(command) = commands.recv() {
        match command {
            DeviceCommand::StartCapture(reply) => {
                let _ = reply.send(state.start_capture());
            }
            DeviceCommand::StopCapture(reply) => {
                let _ = reply.send(state.pause(&state.capture, "capture"));
            }
            DeviceCommand::ReinitCapture(reply) => {
                state.capture = None;
                let _ = reply.send(state.start_capture());
            }
            DeviceCommand::StartPlayback(reply) => {
                let _ = reply.send(state.start_playback());
            }
            DeviceCommand::StopPlayback(reply) => {
                let _ = reply.send(state.pause(&state.playback, "playback"));
            }
            DeviceCommand::ReinitPlayback(reply) => {
                state.playback = None;
                state.playback_buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear();
                let _ = reply.send(state.start_playback());
            }
            DeviceCommand::Write(pcm, reply) => {
                let _ = reply.send(state.write(pcm));
            }
            DeviceCommand::Close => break,
        }
    }

    log::debug!("audio thread exiting");
}

impl WorkerState {
    fn start_capture(&mut self) -> Result<(), AudioError> {
        if self.capture.is_none() {
            self.capture = Some(build_capture(
                self.config.input_device.as_deref(),
                self.frame_tx.clone(),
            )?);
        }
        let stream = self
            .capture
            .as_ref()
            .ok_or_else(|| AudioError::NotOpen("capture".into()))?;
        stream.play().map_err(|e| AudioError::Stream(e.to_string()))
    }

    fn start_playback(&mut self) -> Result<(), AudioError> {
        if self.playback.is_none() {
            self.playback = Some(build_playback(
                self.config.output_device.as_deref(),
                self.playback_buffer.clone(),
            )?);
        }
        let stream = self
            .playback
            .as_ref()
            .ok_or_else(|| AudioError::NotOpen("playback".into()))?;
        stream.play().map_err(|e| AudioError::Stream(e.to_string()))
    }

    fn pause(&self, stream: &Option<Stream>, which: &str) -> Result<(), AudioError> {
        match stream {
            Some(stream) => stream
                .pause()
                .map_err(|e| AudioError::Stream(e.to_string())),
            None => {
                log::debug!("{} stream not open, nothing to stop", which);
                Ok(())
            }
        }
    }

    fn write(&self, pcm: Vec<i16>) -> Result<(), AudioError> {
        if self.playback.is_none() {
            return Err(AudioError::NotOpen("playback".into()));
        }
        let mut buffer = self
            .playback_buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if buffer.len() + pcm.len() > MAX_PLAYBACK_SAMPLES {
            return Err(AudioError::Write("playback buffer full".into()));
        }
        buffer.extend(pcm);
        Ok(())
    }
}

fn find_device(
    name: Option<&str>,
    input: bool,
) -> Result<Device, AudioError> {
    let host = cpal::default_host();
    if let Some(name) = name {
        host.devices()
            .map_err(|e| AudioError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::Device(format!("device not found: {}", name)))
    } else if input {
        host.default_input_device()
            .ok_or_else(|| AudioError::Device("no default input device found".into()))
    } else {
        host.default_output_device()
            .ok_or_else(|| AudioError::Device("no default output device found".into()))
    }
}

fn build_capture(
    name: Option<&str>,
    frame_tx: SyncSender<AudioFrame>,
) -> Result<Stream, AudioError> {
    let device = find_device(name, true)?;

    // The codec is fixed at 16 kHz, so the device has to support it natively.
    let supported = device
        .supported_input_configs()
        .map_err(|e| AudioError::Device(e.to_string()))?
        .find(|c| c.min_sample_rate().0 <= SAMPLE_RATE && c.max_sample_rate().0 >= SAMPLE_RATE)
        .map(|c| c.with_sample_rate(cpal::SampleRate(SAMPLE_RATE)))
        .ok_or_else(|| {
            AudioError::Device("capture device does not support 16 kHz".into())
        })?;

    let stream_config = StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    log::info!(
        "capture configured: {} channels @ {}Hz ({:?})",
        stream_config.channels,
        SAMPLE_RATE,
        supported.sample_format()
    );

    let stream = match supported.sample_format() {
        SampleFormat::I16 => capture_stream::<i16>(&device, &stream_config, frame_tx)?,
        SampleFormat::U16 => capture_stream::<u16>(&device, &stream_config, frame_tx)?,
        SampleFormat::F32 => capture_stream::<f32>(&device, &stream_config, frame_tx)?,
        other => {
            return Err(AudioError::Device(format!(
                "unsupported capture sample format: {:?}",
                other
            )))
        }
    };
    Ok(stream)
}

fn capture_stream<T>(
    device: &Device,
    config: &StreamConfig,
    frame_tx: SyncSender<AudioFrame>,
) -> Result<Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    i16: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut accumulator: Vec<i16> = Vec::with_capacity(FRAME_SIZE);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Channel 0 only; the device is treated as mono.
                for frame in data.chunks(channels) {
                    if let Some(sample) = frame.first() {
                        accumulator.push(i16::from_sample(*sample));
                        if accumulator.len() >= FRAME_SIZE {
                            let samples = std::mem::replace(
                                &mut accumulator,
                                Vec::with_capacity(FRAME_SIZE),
                            );
                            match frame_tx.try_send(AudioFrame { samples }) {
                                Ok(()) | Err(TrySendError::Full(_)) => {}
                                Err(TrySendError::Disconnected(_)) => return,
                            }
                        }
                    }
                }
            },
            |err| log::error!("capture stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))
}

fn build_playback(
    name: Option<&str>,
    buffer: Arc<Mutex<VecDeque<i16>>>,
) -> Result<Stream, AudioError> {
    let device = find_device(name, false)?;

    let supported = device
        .supported_output_configs()
        .map_err(|e| AudioError::Device(e.to_string()))?
        .find(|c| c.min_sample_rate().0 <= SAMPLE_RATE && c.max_sample_rate().0 >= SAMPLE_RATE)
        .map(|c| c.with_sample_rate(cpal::SampleRate(SAMPLE_RATE)))
        .ok_or_else(|| {
            AudioError::Device("playback device does not support 16 kHz".into())
        })?;

    let stream_config = StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    log::info!(
        "playback configured: {} channels @ {}Hz ({:?})",
        stream_config.channels,
        SAMPLE_RATE,
        supported.sample_format()
    );

    let stream = match supported.sample_format() {
        SampleFormat::I16 => playback_stream::<i16>(&device, &stream_config, buffer)?,
        SampleFormat::U16 => playback_stream::<u16>(&device, &stream_config, buffer)?,
        SampleFormat::F32 => playback_stream::<f32>(&device, &stream_config, buffer)?,
        other => {
            return Err(AudioError::Device(format!(
                "unsupported playback sample format: {:?}",
                other
            )))
        }
    };
    Ok(stream)
}

fn playback_stream<T>(
    device: &Device,
    config: &StreamConfig,
    buffer: Arc<Mutex<VecDeque<i16>>>,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<i16> + Send + 'static,
{
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
                for frame in data.chunks_mut(channels) {
                    let sample = buffer.pop_front().unwrap_or(0);
                    for slot in frame.iter_mut() {
                        *slot = T::from_sample(sample);
                    }
                }
            },
            |err| log::error!("playback stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))
}
