//! Server transports.
//!
//! Two wire transports carry the same conversation: a single WebSocket
//! multiplexing JSON control and binary audio, or MQTT for control with a
//! separate UDP socket for audio. The engine sees only [`ProtocolClient`].

pub mod message;
pub mod mqtt;
pub mod websocket;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::Result;
use crate::state::{AbortReason, ListeningMode};

pub use message::{AudioParams, ServerMessage, TtsState};

/// Callbacks a transport fires as traffic arrives. Installed once before
/// `connect` and again by the reconnect path; every callback must be cheap
/// and non-blocking because transports invoke them from their reader tasks.
pub struct ProtocolHandlers {
    pub on_incoming_audio: Box<dyn Fn(Vec<u8>) + Send + Sync>,
    pub on_incoming_json: Box<dyn Fn(ServerMessage) + Send + Sync>,
    pub on_network_error: Box<dyn Fn(String) + Send + Sync>,
    pub on_audio_channel_opened: Box<dyn Fn() + Send + Sync>,
    pub on_audio_channel_closed: Box<dyn Fn() + Send + Sync>,
}

impl Default for ProtocolHandlers {
    fn default() -> Self {
        Self {
            on_incoming_audio: Box::new(|_| {}),
            on_incoming_json: Box::new(|_| {}),
            on_network_error: Box::new(|_| {}),
            on_audio_channel_opened: Box::new(|| {}),
            on_audio_channel_closed: Box::new(|| {}),
        }
    }
}

/// Handler slot shared between a transport and its background tasks.
pub(crate) type SharedHandlers = Arc<Mutex<Option<Arc<ProtocolHandlers>>>>;

pub(crate) fn handlers_slot() -> SharedHandlers {
    Arc::new(Mutex::new(None))
}

pub(crate) fn current_handlers(slot: &SharedHandlers) -> Option<Arc<ProtocolHandlers>> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Parses one inbound control message, logging and swallowing malformed
/// payloads. A broken message never takes the connection down.
pub(crate) fn parse_server_message(text: &str) -> Option<ServerMessage> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => Some(message),
        Err(e) => {
            log::warn!("ignoring malformed server message ({e}): {text}");
            None
        }
    }
}

/// One conversation transport. High-level control messages have default
/// implementations on top of `send_json`, so a transport only supplies the
/// connection lifecycle and the raw control/audio sends.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Install (or replace) the inbound callbacks.
    fn set_handlers(&self, handlers: ProtocolHandlers);

    /// Establish the control connection. Does not open the audio channel.
    async fn connect(&self) -> Result<()>;

    /// Open the audio channel, performing the hello exchange if it is not
    /// already open. Succeeds immediately when already open.
    async fn open_audio_channel(&self) -> Result<()>;

    async fn close_audio_channel(&self);

    /// Ship one compressed audio packet upstream.
    async fn send_audio(&self, packet: Vec<u8>) -> Result<()>;

    /// Ship one JSON control payload upstream.
    async fn send_json(&self, payload: String) -> Result<()>;

    /// Session id assigned by the server hello, empty before the handshake.
    fn session_id(&self) -> String;

    fn is_audio_channel_opened(&self) -> bool;

    fn is_connected(&self) -> bool;

    async fn send_start_listening(&self, mode: ListeningMode) -> Result<()> {
        self.send_json(message::listen_start(&self.session_id(), mode))
            .await
    }

    async fn send_stop_listening(&self) -> Result<()> {
        self.send_json(message::listen_stop(&self.session_id())).await
    }

    async fn send_abort_speaking(&self, reason: AbortReason) -> Result<()> {
        self.send_json(message::abort_speaking(&self.session_id(), reason))
            .await
    }

    async fn send_wake_word_detected(&self, word: &str) -> Result<()> {
        self.send_json(message::listen_detect(&self.session_id(), word))
            .await
    }

    /// User-typed text rides the same detect message as a wake word.
    async fn send_text(&self, text: &str) -> Result<()> {
        self.send_json(message::listen_detect(&self.session_id(), text))
            .await
    }
}
