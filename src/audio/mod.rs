//! Audio pipeline: capture/encode on the way up, queue/decode/play on the
//! way down.
//!
//! The pipeline itself is owned by the scheduler thread and never locked;
//! only the [`PlaybackQueue`] is shared, because network readers push decoded
//! packets into it from their own tasks.

pub mod cpal_device;
pub mod device;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::codec::AudioCodec;
use crate::display::Display;

pub use device::{AudioDevice, AudioError, AudioFrame};

/// Packets decoded and written to the device per scheduler pass. Keeps one
/// pass short so control tasks stay responsive during long replies.
const PLAYBACK_BATCH: usize = 10;

/// Shared queue of compressed audio packets awaiting playback.
///
/// The abort flag travels with the queue: once raised, the draining side
/// discards everything it finds until the next utterance begins.
#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<PlaybackQueueInner>,
}

struct PlaybackQueueInner {
    packets: Mutex<VecDeque<Vec<u8>>>,
    aborted: AtomicBool,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PlaybackQueueInner {
                packets: Mutex::new(VecDeque::new()),
                aborted: AtomicBool::new(false),
            }),
        }
    }

    pub fn push(&self, packet: Vec<u8>) {
        self.lock().push_back(packet);
    }

    pub fn pop(&self) -> Option<Vec<u8>> {
        self.lock().pop_front()
    }

    pub fn purge(&self) {
        self.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn set_aborted(&self, aborted: bool) {
        self.inner.aborted.store(aborted, Ordering::SeqCst);
    }

    pub fn aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.inner.packets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AudioPipeline {
    device: Box<dyn AudioDevice>,
    codec: Box<dyn AudioCodec>,
    queue: PlaybackQueue,
    display: Arc<dyn Display>,
}

impl AudioPipeline {
    pub fn new(
        device: Box<dyn AudioDevice>,
        codec: Box<dyn AudioCodec>,
        queue: PlaybackQueue,
        display: Arc<dyn Display>,
    ) -> Self {
        Self {
            device,
            codec,
            queue,
            display,
        }
    }

    pub fn queue(&self) -> PlaybackQueue {
        self.queue.clone()
    }

    /// Start the capture stream, reopening the device once if the first
    /// attempt fails. A device lost mid-session usually comes back after a
    /// full reopen.
    pub fn start_capture(&mut self) -> Result<(), AudioError> {
        if let Err(first) = self.device.start_capture() {
            log::warn!("capture start failed ({first}), reinitializing device");
            self.device.reinitialize_capture().map_err(|second| {
                self.display
                    .alert("Audio error", "microphone could not be started");
                second
            })?;
        }
        Ok(())
    }

    pub fn stop_capture(&mut self) {
        if let Err(e) = self.device.stop_capture() {
            log::warn!("capture stop failed: {e}");
        }
    }

    pub fn start_playback(&mut self) -> Result<(), AudioError> {
        if let Err(first) = self.device.start_playback() {
            log::warn!("playback start failed ({first}), reinitializing device");
            self.device.reinitialize_playback().map_err(|second| {
                self.display
                    .alert("Audio error", "speaker could not be started");
                second
            })?;
        }
        Ok(())
    }

    pub fn stop_playback(&mut self) {
        if let Err(e) = self.device.stop_playback() {
            log::warn!("playback stop failed: {e}");
        }
    }

    /// Pull one captured frame and compress it. Returns `None` when nothing
    /// is ready or the frame could not be encoded; capture hiccups drop the
    /// frame rather than stall the session.
    pub fn capture_frame(&mut self) -> Option<Vec<u8>> {
        let frame = match self.device.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("capture read failed: {e}");
                return None;
            }
        };
        match self.codec.encode(&frame.samples) {
            Ok(packet) => Some(packet),
            Err(e) => {
                log::warn!("dropping unencodable frame: {e}");
                None
            }
        }
    }

    /// Decode up to [`PLAYBACK_BATCH`] queued packets into one buffer and
    /// hand it to the device as a single write. Honors the abort flag while
    /// dequeuing, and never writes a partial batch after an abort.
    pub fn process_playback_batch(&mut self) {
        let mut pcm = Vec::new();
        for _ in 0..PLAYBACK_BATCH {
            if self.queue.aborted() {
                self.queue.purge();
                return;
            }
            let packet = match self.queue.pop() {
                Some(packet) => packet,
                None => break,
            };
            match self.codec.decode(&packet) {
                Ok(samples) => pcm.extend_from_slice(&samples),
                Err(e) => log::warn!("dropping undecodable packet: {e}"),
            }
        }
        if self.queue.aborted() {
            self.queue.purge();
            return;
        }
        if !pcm.is_empty() {
            self.write_with_recovery(&pcm);
        }
    }

    /// Keep draining until the queue runs dry or the timeout hits, then drop
    /// whatever is left. Called when leaving the speaking state so the tail
    /// of a reply is not cut off mid-word.
    pub fn wait_for_playback_drained(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.queue.is_empty() && Instant::now() < deadline {
            self.process_playback_batch();
            if self.queue.is_empty() || self.queue.aborted() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        if !self.queue.is_empty() {
            log::warn!("playback drain timed out, dropping {} packets", self.queue.len());
            self.queue.purge();
        }
    }

    pub fn close(&mut self) {
        self.device.close();
    }

    fn write_with_recovery(&mut self, pcm: &[i16]) {
        if let Err(first) = self.device.write_pcm(pcm) {
            log::warn!("playback write failed ({first}), reinitializing device");
            let recovered = self
                .device
                .reinitialize_playback()
                .and_then(|_| self.device.write_pcm(pcm));
            if let Err(second) = recovered {
                log::error!("playback write failed after reinit: {second}");
                self.display
                    .alert("Audio error", "audio output stopped working");
            }
        }
    }
}
