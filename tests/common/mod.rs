//! Shared test doubles for driving the engine without hardware or network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use voxbridge::audio::{AudioDevice, AudioError, AudioFrame};
use voxbridge::codec::{AudioCodec, CodecError, FRAME_SIZE};
use voxbridge::display::Display;
use voxbridge::error::{Result, VoxError};
use voxbridge::protocol::{ProtocolClient, ProtocolHandlers, ServerMessage};
use voxbridge::state::{AbortReason, ListeningMode};
use voxbridge::wakeword::{DetectorCallbacks, WakeWordDetector};

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Everything the engine asked the transport to send, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Audio(Vec<u8>),
    StartListening(ListeningMode),
    StopListening,
    Abort(AbortReason),
    WakeWordDetected(String),
    Text(String),
    Json(String),
}

struct MockProtocolInner {
    sent: Mutex<Vec<Sent>>,
    handlers: Mutex<Option<Arc<ProtocolHandlers>>>,
    connected: AtomicBool,
    opened: AtomicBool,
    /// Scripted connect outcomes, oldest first; empty means success.
    connect_results: Mutex<VecDeque<bool>>,
    connect_calls: AtomicUsize,
    open_calls: AtomicUsize,
    open_results: Mutex<VecDeque<bool>>,
}

#[derive(Clone)]
pub struct MockProtocol {
    inner: Arc<MockProtocolInner>,
}

impl MockProtocol {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockProtocolInner {
                sent: Mutex::new(Vec::new()),
                handlers: Mutex::new(None),
                connected: AtomicBool::new(false),
                opened: AtomicBool::new(false),
                connect_results: Mutex::new(VecDeque::new()),
                connect_calls: AtomicUsize::new(0),
                open_calls: AtomicUsize::new(0),
                open_results: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self, matcher: impl Fn(&Sent) -> bool) -> usize {
        self.inner.sent.lock().unwrap().iter().filter(|s| matcher(s)).count()
    }

    pub fn connect_calls(&self) -> usize {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> usize {
        self.inner.open_calls.load(Ordering::SeqCst)
    }

    pub fn script_connect(&self, outcomes: &[bool]) {
        self.inner
            .connect_results
            .lock()
            .unwrap()
            .extend(outcomes.iter().copied());
    }

    pub fn script_open(&self, outcomes: &[bool]) {
        self.inner
            .open_results
            .lock()
            .unwrap()
            .extend(outcomes.iter().copied());
    }

    fn handlers(&self) -> Option<Arc<ProtocolHandlers>> {
        self.inner.handlers.lock().unwrap().clone()
    }

    pub fn fire_json(&self, raw: &str) {
        let message: ServerMessage = serde_json::from_str(raw).unwrap();
        if let Some(handlers) = self.handlers() {
            (handlers.on_incoming_json)(message);
        }
    }

    pub fn fire_audio(&self, packet: Vec<u8>) {
        if let Some(handlers) = self.handlers() {
            (handlers.on_incoming_audio)(packet);
        }
    }

    pub fn fire_network_error(&self, reason: &str) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.opened.store(false, Ordering::SeqCst);
        if let Some(handlers) = self.handlers() {
            (handlers.on_network_error)(reason.to_string());
        }
    }

    fn record(&self, sent: Sent) {
        self.inner.sent.lock().unwrap().push(sent);
    }
}

#[async_trait]
impl ProtocolClient for MockProtocol {
    fn set_handlers(&self, handlers: ProtocolHandlers) {
        *self.inner.handlers.lock().unwrap() = Some(Arc::new(handlers));
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connect_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .inner
            .connect_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(true);
        if outcome {
            self.inner.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(VoxError::Transport("scripted connect failure".into()))
        }
    }

    async fn open_audio_channel(&self) -> Result<()> {
        if self.is_audio_channel_opened() {
            return Ok(());
        }
        self.inner.open_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .inner
            .open_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(true);
        if outcome {
            self.inner.connected.store(true, Ordering::SeqCst);
            self.inner.opened.store(true, Ordering::SeqCst);
            if let Some(handlers) = self.handlers() {
                (handlers.on_audio_channel_opened)();
            }
            Ok(())
        } else {
            Err(VoxError::Transport("scripted open failure".into()))
        }
    }

    async fn close_audio_channel(&self) {
        let was_open = self.inner.opened.swap(false, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        if was_open {
            if let Some(handlers) = self.handlers() {
                (handlers.on_audio_channel_closed)();
            }
        }
    }

    async fn send_audio(&self, packet: Vec<u8>) -> Result<()> {
        self.record(Sent::Audio(packet));
        Ok(())
    }

    async fn send_json(&self, payload: String) -> Result<()> {
        self.record(Sent::Json(payload));
        Ok(())
    }

    fn session_id(&self) -> String {
        "test-session".into()
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.inner.opened.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn send_start_listening(&self, mode: ListeningMode) -> Result<()> {
        self.record(Sent::StartListening(mode));
        Ok(())
    }

    async fn send_stop_listening(&self) -> Result<()> {
        self.record(Sent::StopListening);
        Ok(())
    }

    async fn send_abort_speaking(&self, reason: AbortReason) -> Result<()> {
        self.record(Sent::Abort(reason));
        Ok(())
    }

    async fn send_wake_word_detected(&self, word: &str) -> Result<()> {
        self.record(Sent::WakeWordDetected(word.to_string()));
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.record(Sent::Text(text.to_string()));
        Ok(())
    }
}

struct MockDeviceInner {
    capture_running: AtomicBool,
    playback_running: AtomicBool,
    frames: Mutex<VecDeque<AudioFrame>>,
    writes: Mutex<Vec<Vec<i16>>>,
}

#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<MockDeviceInner>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockDeviceInner {
                capture_running: AtomicBool::new(false),
                playback_running: AtomicBool::new(false),
                frames: Mutex::new(VecDeque::new()),
                writes: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn feed_frame(&self) {
        self.inner
            .frames
            .lock()
            .unwrap()
            .push_back(AudioFrame::silence());
    }

    pub fn write_count(&self) -> usize {
        self.inner.writes.lock().unwrap().len()
    }

    /// Total samples written across all writes, batching aside.
    pub fn written_samples(&self) -> usize {
        self.inner.writes.lock().unwrap().iter().map(Vec::len).sum()
    }

    pub fn capture_running(&self) -> bool {
        self.inner.capture_running.load(Ordering::SeqCst)
    }

    pub fn playback_running(&self) -> bool {
        self.inner.playback_running.load(Ordering::SeqCst)
    }
}

impl AudioDevice for MockDevice {
    fn start_capture(&mut self) -> std::result::Result<(), AudioError> {
        self.inner.capture_running.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn stop_capture(&mut self) -> std::result::Result<(), AudioError> {
        self.inner.capture_running.store(false, Ordering::SeqCst);
        Ok(())
    }
    fn reinitialize_capture(&mut self) -> std::result::Result<(), AudioError> {
        self.inner.capture_running.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn read_frame(&mut self) -> std::result::Result<Option<AudioFrame>, AudioError> {
        Ok(self.inner.frames.lock().unwrap().pop_front())
    }
    fn start_playback(&mut self) -> std::result::Result<(), AudioError> {
        self.inner.playback_running.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn stop_playback(&mut self) -> std::result::Result<(), AudioError> {
        self.inner.playback_running.store(false, Ordering::SeqCst);
        Ok(())
    }
    fn reinitialize_playback(&mut self) -> std::result::Result<(), AudioError> {
        self.inner.playback_running.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn write_pcm(&mut self, pcm: &[i16]) -> std::result::Result<(), AudioError> {
        self.inner.writes.lock().unwrap().push(pcm.to_vec());
        Ok(())
    }
    fn close(&mut self) {}
}

/// Byte-for-sample passthrough; never fails.
pub struct MockCodec;

impl AudioCodec for MockCodec {
    fn encode(&mut self, pcm: &[i16]) -> std::result::Result<Vec<u8>, CodecError> {
        Ok(pcm.iter().take(8).map(|&s| s as u8).collect())
    }
    fn decode(&mut self, _packet: &[u8]) -> std::result::Result<Vec<i16>, CodecError> {
        Ok(vec![0i16; FRAME_SIZE])
    }
}

pub struct MockDetector {
    callbacks: Mutex<Option<DetectorCallbacks>>,
    running: AtomicBool,
}

impl MockDetector {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn trigger(&self, word: &str) {
        if let Some(callbacks) = &*self.callbacks.lock().unwrap() {
            (callbacks.on_detected)(word.to_string(), format!("... {word} ..."));
        }
    }
}

impl WakeWordDetector for MockDetector {
    fn set_callbacks(&self, callbacks: DetectorCallbacks) {
        *self.callbacks.lock().unwrap() = Some(callbacks);
    }
    fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MockDisplayInner {
    statuses: Mutex<Vec<String>>,
    texts: Mutex<Vec<(String, String)>>,
    emotions: Mutex<Vec<String>>,
    connection: Mutex<Vec<bool>>,
    alerts: Mutex<Vec<(String, String)>>,
}

#[derive(Clone, Default)]
pub struct MockDisplay {
    inner: Arc<MockDisplayInner>,
}

impl MockDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<(String, String)> {
        self.inner.alerts.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.inner.statuses.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<(String, String)> {
        self.inner.texts.lock().unwrap().clone()
    }

    pub fn emotions(&self) -> Vec<String> {
        self.inner.emotions.lock().unwrap().clone()
    }

    pub fn last_connection(&self) -> Option<bool> {
        self.inner.connection.lock().unwrap().last().copied()
    }
}

impl Display for MockDisplay {
    fn update_status(&self, status: &str) {
        self.inner.statuses.lock().unwrap().push(status.to_string());
    }
    fn update_text(&self, role: &str, text: &str) {
        self.inner
            .texts
            .lock()
            .unwrap()
            .push((role.to_string(), text.to_string()));
    }
    fn update_emotion(&self, emotion: &str) {
        self.inner.emotions.lock().unwrap().push(emotion.to_string());
    }
    fn update_connection_status(&self, connected: bool) {
        self.inner.connection.lock().unwrap().push(connected);
    }
    fn alert(&self, title: &str, message: &str) {
        self.inner
            .alerts
            .lock()
            .unwrap()
            .push((title.to_string(), message.to_string()));
    }
}
