//! The conversation engine.
//!
//! All mutable state lives in [`Engine`], owned by a single scheduler thread
//! that drains the task queue at a fixed cadence. Protocol callbacks,
//! hardware pollers and user commands never touch the engine directly; they
//! enqueue closures and the scheduler applies them in order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};

use crate::audio::{AudioDevice, AudioPipeline, PlaybackQueue};
use crate::codec::AudioCodec;
use crate::display::Display;
use crate::error::{Result, VoxError};
use crate::protocol::{ProtocolClient, ProtocolHandlers, ServerMessage, TtsState};
use crate::scheduler::{run_tasks, Signals, TaskKind, TaskQueue, DRAIN_INTERVAL};
use crate::state::{AbortReason, DeviceState, ListeningMode, StateSnapshot};
use crate::supervisor::{ConnectionSupervisor, SupervisorConfig};
use crate::wakeword::{WakeWordDetector, WakeWordGate};

/// How often the capture poller checks for a ready frame.
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(30);
/// How often the playback poller checks for queued packets.
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long the finish-speaking worker waits for the queue to empty.
const FINISH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const FINISH_POLL_LIMIT: u32 = 30;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub supervisor: SupervisorConfig,
    /// Upper bound on connect/handshake operations performed inline on the
    /// scheduler thread.
    pub sync_op_timeout: Duration,
    /// Pause between aborting speech for a wake word and re-opening the
    /// microphone, so the tail of our own playback is not captured.
    pub abort_guard_delay: Duration,
    pub playback_drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            sync_op_timeout: Duration::from_secs(10),
            abort_guard_delay: Duration::from_millis(200),
            playback_drain_timeout: Duration::from_secs(3),
        }
    }
}

/// Everything the engine is built from.
pub struct EngineParts {
    pub protocol: Arc<dyn ProtocolClient>,
    pub device: Box<dyn AudioDevice>,
    pub codec: Box<dyn AudioCodec>,
    pub detector: Arc<dyn WakeWordDetector>,
    pub display: Arc<dyn Display>,
    pub config: EngineConfig,
}

/// The cheap, thread-safe pieces protocol callbacks need. Cloning is free;
/// everything inside is an `Arc`.
pub struct EngineHooks {
    pub(crate) tasks: TaskQueue<Engine>,
    pub(crate) queue: PlaybackQueue,
    pub(crate) snapshot: StateSnapshot,
    pub(crate) signals: Arc<Signals>,
}

impl Clone for EngineHooks {
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
            queue: self.queue.clone(),
            snapshot: self.snapshot.clone(),
            signals: self.signals.clone(),
        }
    }
}

/// Builds the callback set a transport fires as traffic arrives. Installed
/// on every (re)connect so a fresh transport always reports into the same
/// engine.
pub(crate) fn build_protocol_handlers(hooks: &EngineHooks) -> ProtocolHandlers {
    let audio_hooks = hooks.clone();
    let json_tasks = hooks.tasks.clone();
    let error_tasks = hooks.tasks.clone();
    let opened_tasks = hooks.tasks.clone();
    let closed_tasks = hooks.tasks.clone();

    ProtocolHandlers {
        // Hot path: runs for every audio packet, so it only touches the
        // queue and never schedules a task.
        on_incoming_audio: Box::new(move |packet| {
            if audio_hooks.snapshot.load() == DeviceState::Speaking {
                audio_hooks.queue.push(packet);
                audio_hooks.signals.set_output_ready();
            }
        }),
        on_incoming_json: Box::new(move |message| match message {
            ServerMessage::Tts { state, text } => match state {
                TtsState::Start => {
                    json_tasks.schedule(|engine: &mut Engine| engine.handle_tts_start())
                }
                TtsState::Stop => {
                    json_tasks.schedule(|engine: &mut Engine| engine.handle_tts_stop())
                }
                TtsState::SentenceStart => {
                    if let Some(text) = text {
                        json_tasks.schedule(move |engine: &mut Engine| {
                            engine.display.update_text("assistant", &text)
                        });
                    }
                }
            },
            ServerMessage::Stt { text } => {
                json_tasks
                    .schedule(move |engine: &mut Engine| engine.display.update_text("user", &text))
            }
            ServerMessage::Llm { emotion } => {
                json_tasks
                    .schedule(move |engine: &mut Engine| engine.display.update_emotion(&emotion))
            }
            ServerMessage::Hello { .. } => log::debug!("hello outside handshake ignored"),
            ServerMessage::Unknown => log::debug!("unhandled server message type"),
        }),
        on_network_error: Box::new(move |reason| {
            error_tasks.schedule_tagged(TaskKind::NetworkError, move |engine: &mut Engine| {
                engine.on_network_error(&reason)
            });
        }),
        on_audio_channel_opened: Box::new(move || {
            opened_tasks.schedule(|engine: &mut Engine| engine.on_channel_opened());
        }),
        on_audio_channel_closed: Box::new(move || {
            closed_tasks.schedule(|engine: &mut Engine| engine.on_channel_closed());
        }),
    }
}

pub struct Engine {
    state: DeviceState,
    snapshot: StateSnapshot,
    /// Continue into another listening turn when the server stops speaking.
    keep_listening: bool,
    pipeline: AudioPipeline,
    protocol: Arc<dyn ProtocolClient>,
    gate: WakeWordGate,
    display: Arc<dyn Display>,
    listeners: Vec<Box<dyn Fn(DeviceState) + Send>>,
    hooks: EngineHooks,
    rt: Handle,
    supervisor: ConnectionSupervisor,
    config: EngineConfig,
}

impl Engine {
    /// Builds the engine and starts its threads. The returned handle is the
    /// only way in from outside.
    pub fn start(parts: EngineParts) -> Result<EngineHandle> {
        let EngineParts {
            protocol,
            device,
            codec,
            detector,
            display,
            config,
        } = parts;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("vox-io")
            .build()?;

        let signals = Signals::new();
        let tasks: TaskQueue<Engine> = TaskQueue::new(signals.clone());
        let snapshot = StateSnapshot::new(DeviceState::Idle);
        let queue = PlaybackQueue::new();
        let hooks = EngineHooks {
            tasks: tasks.clone(),
            queue: queue.clone(),
            snapshot: snapshot.clone(),
            signals: signals.clone(),
        };

        let pipeline = AudioPipeline::new(device, codec, queue.clone(), display.clone());

        let gate_tasks = tasks.clone();
        let gate = WakeWordGate::new(
            detector,
            Box::new(move |word, _text| {
                gate_tasks.schedule(move |engine: &mut Engine| engine.handle_wake_word(&word));
            }),
        );

        let supervisor =
            ConnectionSupervisor::new(config.supervisor.clone(), protocol.clone(), hooks.clone());

        let mut engine = Engine {
            state: DeviceState::Idle,
            snapshot: snapshot.clone(),
            keep_listening: false,
            pipeline,
            protocol,
            gate,
            display,
            listeners: Vec::new(),
            hooks,
            rt: runtime.handle().clone(),
            supervisor,
            config,
        };

        tasks.schedule(|engine: &mut Engine| engine.initialize());

        let mut threads = Vec::new();

        let scheduler_signals = signals.clone();
        let scheduler_tasks = tasks.clone();
        threads.push(
            std::thread::Builder::new()
                .name("vox-scheduler".into())
                .spawn(move || loop {
                    scheduler_signals.wait(DRAIN_INTERVAL);
                    if scheduler_signals.is_shutdown() {
                        engine.shutdown_inner();
                        break;
                    }
                    if scheduler_signals.take_input_ready() {
                        engine.handle_input_audio();
                    }
                    if scheduler_signals.take_output_ready() {
                        engine.handle_output_audio();
                    }
                    run_tasks(scheduler_tasks.drain(), &mut engine);
                })?,
        );

        let input_signals = signals.clone();
        let input_snapshot = snapshot.clone();
        threads.push(
            std::thread::Builder::new()
                .name("vox-capture-poll".into())
                .spawn(move || {
                    while !input_signals.is_shutdown() {
                        if input_snapshot.load() == DeviceState::Listening {
                            input_signals.set_input_ready();
                        }
                        std::thread::sleep(INPUT_POLL_INTERVAL);
                    }
                })?,
        );

        let output_signals = signals.clone();
        let output_snapshot = snapshot.clone();
        let output_queue = queue.clone();
        threads.push(
            std::thread::Builder::new()
                .name("vox-playback-poll".into())
                .spawn(move || {
                    while !output_signals.is_shutdown() {
                        if output_snapshot.load() == DeviceState::Speaking
                            && !output_queue.is_empty()
                        {
                            output_signals.set_output_ready();
                        }
                        std::thread::sleep(OUTPUT_POLL_INTERVAL);
                    }
                })?,
        );

        Ok(EngineHandle {
            tasks,
            signals,
            snapshot,
            runtime: Some(runtime),
            threads,
        })
    }

    /// Transition to `new`, running exit and entry effects. Re-entering the
    /// current state is a no-op with zero side effects.
    fn set_state(&mut self, new: DeviceState) {
        if self.state == new {
            return;
        }
        if self.state == DeviceState::Speaking {
            self.pipeline
                .wait_for_playback_drained(self.config.playback_drain_timeout);
        }
        let old = self.state;
        self.state = new;
        self.snapshot.store(new);
        log::info!("state {old} -> {new}");

        if old == DeviceState::Listening {
            self.pipeline.stop_capture();
        }

        match new {
            DeviceState::Idle => {
                self.display.update_status("standby");
                self.display.update_emotion("neutral");
                self.pipeline.stop_playback();
                self.gate.resume();
            }
            DeviceState::Connecting => {
                self.display.update_status("connecting");
                self.gate.pause();
            }
            DeviceState::Listening => {
                self.display.update_status("listening");
                self.gate.pause();
                if let Err(e) = self.pipeline.start_capture() {
                    log::error!("could not start capture: {e}");
                }
            }
            DeviceState::Speaking => {
                self.display.update_status("speaking");
                self.gate.pause();
                if let Err(e) = self.pipeline.start_playback() {
                    log::error!("could not start playback: {e}");
                }
            }
        }

        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(new))).is_err() {
                log::error!("state listener panicked; remaining listeners unaffected");
            }
        }
    }

    fn initialize(&mut self) {
        self.protocol.set_handlers(build_protocol_handlers(&self.hooks));
        if let Err(e) = self.gate.start() {
            log::warn!("wake word detector unavailable: {e}");
        }
        let protocol = self.protocol.clone();
        match self.await_protocol(async move { protocol.connect().await }) {
            Ok(()) => self.display.update_connection_status(true),
            Err(e) => {
                log::warn!("initial connect failed: {e}");
                self.alert("Connection error", "failed to connect to server");
            }
        }
    }

    /// Drive a protocol future to completion on the scheduler thread, with
    /// an upper bound so a dead server cannot wedge the scheduler.
    fn await_protocol<F>(&self, fut: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send,
    {
        let limit = self.config.sync_op_timeout;
        self.rt.block_on(async move {
            match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(VoxError::HandshakeTimeout(limit)),
            }
        })
    }

    fn handle_input_audio(&mut self) {
        if self.state != DeviceState::Listening {
            return;
        }
        while let Some(packet) = self.pipeline.capture_frame() {
            if !self.protocol.is_audio_channel_opened() {
                break;
            }
            let protocol = self.protocol.clone();
            self.rt.spawn(async move {
                if let Err(e) = protocol.send_audio(packet).await {
                    log::debug!("dropping capture packet: {e}");
                }
            });
        }
    }

    fn handle_output_audio(&mut self) {
        if self.state != DeviceState::Speaking {
            return;
        }
        self.pipeline.process_playback_batch();
    }

    /// Open the audio channel if needed and move to listening. Only valid
    /// from idle; anything else is logged and dropped.
    fn begin_listening(&mut self, mode: ListeningMode) {
        if self.state != DeviceState::Idle {
            log::debug!("ignoring listen request in state {}", self.state);
            return;
        }
        if !self.protocol.is_audio_channel_opened() {
            self.set_state(DeviceState::Connecting);
            let protocol = self.protocol.clone();
            if let Err(e) = self.await_protocol(async move { protocol.open_audio_channel().await })
            {
                log::warn!("could not open audio channel: {e}");
                self.set_state(DeviceState::Idle);
                self.alert("Connection error", "could not reach the server");
                return;
            }
        }
        let protocol = self.protocol.clone();
        self.rt.spawn(async move {
            if let Err(e) = protocol.send_start_listening(mode).await {
                log::warn!("start-listening message failed: {e}");
            }
        });
        self.set_state(DeviceState::Listening);
    }

    fn handle_wake_word(&mut self, word: &str) {
        log::info!("wake word detected: {word}");
        match self.state {
            DeviceState::Idle => {
                self.gate.pause();
                self.keep_listening = true;
                if !self.protocol.is_audio_channel_opened() {
                    self.set_state(DeviceState::Connecting);
                    let protocol = self.protocol.clone();
                    if let Err(e) =
                        self.await_protocol(async move { protocol.open_audio_channel().await })
                    {
                        log::warn!("could not open audio channel: {e}");
                        self.set_state(DeviceState::Idle);
                        self.alert("Connection error", "could not reach the server");
                        return;
                    }
                }
                // One task so detect and listen-start keep their order.
                let protocol = self.protocol.clone();
                let word = word.to_string();
                self.rt.spawn(async move {
                    if let Err(e) = protocol.send_wake_word_detected(&word).await {
                        log::warn!("wake word report failed: {e}");
                        return;
                    }
                    if let Err(e) = protocol.send_start_listening(ListeningMode::AutoStop).await {
                        log::warn!("start-listening message failed: {e}");
                    }
                });
                self.set_state(DeviceState::Listening);
            }
            // A detection accepted while idle can land after the reply started.
            DeviceState::Speaking => self.abort_speaking(AbortReason::WakeWordDetected),
            _ => {}
        }
    }

    /// Cut the current reply short. Purges locally first so playback stops
    /// within one packet, then tells the server.
    fn abort_speaking(&mut self, reason: AbortReason) {
        if self.state != DeviceState::Speaking {
            return;
        }
        log::info!("aborting speech ({reason})");
        self.hooks.queue.set_aborted(true);
        self.hooks.queue.purge();

        let protocol = self.protocol.clone();
        self.rt.spawn(async move {
            if let Err(e) = protocol.send_abort_speaking(reason).await {
                log::warn!("abort message failed: {e}");
            }
        });
        self.set_state(DeviceState::Idle);

        if reason == AbortReason::WakeWordDetected && self.keep_listening {
            let tasks = self.hooks.tasks.clone();
            let delay = self.config.abort_guard_delay;
            self.rt.spawn(async move {
                tokio::time::sleep(delay).await;
                tasks.schedule(|engine: &mut Engine| {
                    engine.begin_listening(ListeningMode::AutoStop)
                });
            });
        }
    }

    fn handle_tts_start(&mut self) {
        self.hooks.queue.set_aborted(false);
        if matches!(self.state, DeviceState::Idle | DeviceState::Listening) {
            self.hooks.queue.purge();
            self.set_state(DeviceState::Speaking);
        }
    }

    /// The server is done sending audio; wait off-thread for local playback
    /// to catch up before deciding where to go next.
    fn handle_tts_stop(&mut self) {
        if self.state != DeviceState::Speaking {
            return;
        }
        let queue = self.hooks.queue.clone();
        let tasks = self.hooks.tasks.clone();
        self.rt.spawn(async move {
            for _ in 0..FINISH_POLL_LIMIT {
                if queue.is_empty() {
                    break;
                }
                tokio::time::sleep(FINISH_POLL_INTERVAL).await;
            }
            tasks.schedule_tagged(TaskKind::FinishSpeaking, |engine: &mut Engine| {
                engine.finish_speaking()
            });
        });
    }

    fn finish_speaking(&mut self) {
        if self.state != DeviceState::Speaking {
            return;
        }
        self.hooks.queue.purge();
        if self.keep_listening {
            let protocol = self.protocol.clone();
            self.rt.spawn(async move {
                if let Err(e) = protocol.send_start_listening(ListeningMode::AutoStop).await {
                    log::warn!("start-listening message failed: {e}");
                }
            });
            self.set_state(DeviceState::Listening);
        } else {
            self.set_state(DeviceState::Idle);
        }
    }

    fn on_network_error(&mut self, reason: &str) {
        log::warn!("network error: {reason}");
        self.keep_listening = false;
        self.hooks.queue.set_aborted(true);
        self.hooks.queue.purge();
        self.display.update_connection_status(false);
        self.set_state(DeviceState::Idle);

        let protocol = self.protocol.clone();
        self.rt.spawn(async move {
            protocol.close_audio_channel().await;
        });
        self.supervisor.spawn_reconnect(&self.rt);
    }

    fn on_channel_opened(&mut self) {
        log::info!("audio channel opened");
        self.display.update_connection_status(true);
    }

    fn on_channel_closed(&mut self) {
        log::info!("audio channel closed");
        self.pipeline.stop_capture();
        self.pipeline.stop_playback();
        self.display.update_connection_status(false);
        if self.state != DeviceState::Idle {
            self.hooks.queue.purge();
            self.set_state(DeviceState::Idle);
        }
    }

    pub(crate) fn on_reconnected(&mut self) {
        log::info!("reconnected to server");
        self.display.update_connection_status(true);
        self.set_state(DeviceState::Idle);
    }

    pub(crate) fn on_reconnect_exhausted(&mut self) {
        self.alert("Connection error", "unable to reconnect to the server");
        self.set_state(DeviceState::Idle);
    }

    /// Push-to-talk press: start a manual turn, or cut the assistant off.
    fn start_listening_now(&mut self) {
        self.keep_listening = false;
        match self.state {
            DeviceState::Idle => self.begin_listening(ListeningMode::Manual),
            DeviceState::Speaking => self.abort_speaking(AbortReason::WakeWordDetected),
            _ => {}
        }
    }

    /// Push-to-talk release.
    fn stop_listening_now(&mut self) {
        if self.state != DeviceState::Listening {
            return;
        }
        let protocol = self.protocol.clone();
        self.rt.spawn(async move {
            if let Err(e) = protocol.send_stop_listening().await {
                log::warn!("stop-listening message failed: {e}");
            }
        });
        self.set_state(DeviceState::Idle);
    }

    /// Single-button interface: idle starts a hands-free conversation,
    /// speaking aborts it, listening hangs up.
    fn toggle_chat_state(&mut self) {
        match self.state {
            DeviceState::Idle => {
                self.keep_listening = true;
                self.begin_listening(ListeningMode::AutoStop);
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::None),
            DeviceState::Listening => {
                self.keep_listening = false;
                let protocol = self.protocol.clone();
                self.rt.spawn(async move {
                    protocol.close_audio_channel().await;
                });
                self.set_state(DeviceState::Idle);
            }
            DeviceState::Connecting => {}
        }
    }

    fn send_text_now(&mut self, text: String) {
        if !self.protocol.is_audio_channel_opened() {
            self.alert("Not connected", "connect before sending text");
            return;
        }
        self.display.update_text("user", &text);
        let protocol = self.protocol.clone();
        self.rt.spawn(async move {
            if let Err(e) = protocol.send_text(&text).await {
                log::warn!("text message failed: {e}");
            }
        });
    }

    fn set_auto_conversation(&mut self, enabled: bool) {
        if self.state != DeviceState::Idle {
            self.alert("Busy", "finish the current conversation first");
            return;
        }
        self.keep_listening = enabled;
        log::info!("auto conversation {}", if enabled { "on" } else { "off" });
    }

    fn alert(&self, title: &str, message: &str) {
        log::warn!("{title}: {message}");
        self.display.alert(title, message);
    }

    fn shutdown_inner(&mut self) {
        log::info!("engine shutting down");
        if let Err(e) = self.gate.stop() {
            log::warn!("wake word detector stop failed: {e}");
        }
        let protocol = self.protocol.clone();
        let _ = self.rt.block_on(async move {
            tokio::time::timeout(Duration::from_secs(2), protocol.close_audio_channel()).await
        });
        self.pipeline.stop_capture();
        self.pipeline.stop_playback();
        self.pipeline.close();
    }
}

/// Thread-safe facade over a running engine. Every method returns
/// immediately; the work happens on the scheduler thread.
pub struct EngineHandle {
    tasks: TaskQueue<Engine>,
    signals: Arc<Signals>,
    snapshot: StateSnapshot,
    runtime: Option<Runtime>,
    threads: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn state(&self) -> DeviceState {
        self.snapshot.load()
    }

    /// Run an arbitrary closure on the scheduler thread.
    pub fn schedule(&self, run: impl FnOnce(&mut Engine) + Send + 'static) {
        self.tasks.schedule(run);
    }

    pub fn start_listening(&self) {
        self.tasks
            .schedule(|engine: &mut Engine| engine.start_listening_now());
    }

    pub fn stop_listening(&self) {
        self.tasks
            .schedule(|engine: &mut Engine| engine.stop_listening_now());
    }

    pub fn toggle_chat_state(&self) {
        self.tasks
            .schedule(|engine: &mut Engine| engine.toggle_chat_state());
    }

    pub fn abort_speaking(&self, reason: AbortReason) {
        self.tasks
            .schedule_tagged(TaskKind::Abort, move |engine: &mut Engine| {
                engine.abort_speaking(reason)
            });
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.tasks
            .schedule(move |engine: &mut Engine| engine.send_text_now(text));
    }

    pub fn set_auto_conversation(&self, enabled: bool) {
        self.tasks
            .schedule(move |engine: &mut Engine| engine.set_auto_conversation(enabled));
    }

    /// Register a state-change listener. A panicking listener is isolated
    /// from the engine and from other listeners.
    pub fn on_state_changed(&self, listener: impl Fn(DeviceState) + Send + 'static) {
        self.tasks.schedule(move |engine: &mut Engine| {
            engine.listeners.push(Box::new(listener));
        });
    }

    /// Stop the engine and wait for its threads. Idempotent.
    pub fn shutdown(&mut self) {
        if self.threads.is_empty() && self.runtime.is_none() {
            return;
        }
        self.signals.request_shutdown();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
