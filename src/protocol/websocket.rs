//! WebSocket transport: one connection multiplexes JSON control frames
//! (text) and compressed audio packets (binary).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{
    current_handlers, handlers_slot, message, parse_server_message, ProtocolClient,
    ProtocolHandlers, ServerMessage, SharedHandlers,
};
use crate::error::{Result, VoxError};

use async_trait::async_trait;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WebSocketConfig {
    pub url: String,
    pub device_id: String,
    pub client_id: String,
    pub access_token: Option<SecretString>,
    pub handshake_timeout: Duration,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            device_id: device_id.into(),
            client_id: "voxbridge".into(),
            access_token: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

pub struct WebSocketClient {
    config: WebSocketConfig,
    handlers: SharedHandlers,
    writer: TokioMutex<Option<WsSink>>,
    connected: Arc<AtomicBool>,
    audio_opened: Arc<AtomicBool>,
    session_id: Arc<StdMutex<Option<String>>>,
    hello_notify: Arc<Notify>,
    cancel: StdMutex<CancellationToken>,
}

impl WebSocketClient {
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            handlers: handlers_slot(),
            writer: TokioMutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            audio_opened: Arc::new(AtomicBool::new(false)),
            session_id: Arc::new(StdMutex::new(None)),
            hello_notify: Arc::new(Notify::new()),
            cancel: StdMutex::new(CancellationToken::new()),
        }
    }

    fn fresh_cancel_token(&self) -> CancellationToken {
        let mut guard = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        guard.cancel();
        *guard = CancellationToken::new();
        guard.clone()
    }

    fn cancel_reader(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }

    async fn send_raw(&self, frame: Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| VoxError::NotReady("websocket not connected".into()))?;
        if let Err(e) = sink.send(frame).await {
            drop(guard);
            log::warn!("websocket send failed: {e}");
            self.connected.store(false, Ordering::SeqCst);
            self.audio_opened.store(false, Ordering::SeqCst);
            if let Some(handlers) = current_handlers(&self.handlers) {
                (handlers.on_network_error)(e.to_string());
            }
            return Err(VoxError::Transport(e.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for WebSocketClient {
    fn set_handlers(&self, handlers: ProtocolHandlers) {
        *self.handlers.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handlers));
    }

    async fn connect(&self) -> Result<()> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| VoxError::Transport(format!("bad server url: {e}")))?;

        let headers = request.headers_mut();
        headers.insert(
            "device-id",
            HeaderValue::from_str(&self.config.device_id)
                .map_err(|e| VoxError::Transport(format!("bad device id: {e}")))?,
        );
        headers.insert(
            "client-id",
            HeaderValue::from_str(&self.config.client_id)
                .map_err(|e| VoxError::Transport(format!("bad client id: {e}")))?,
        );
        headers.insert(
            "protocol-version",
            HeaderValue::from_static("1"),
        );
        if let Some(token) = &self.config.access_token {
            let bearer = format!("Bearer {}", token.expose_secret());
            headers.insert(
                "authorization",
                HeaderValue::from_str(&bearer)
                    .map_err(|e| VoxError::Transport(format!("bad access token: {e}")))?,
            );
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| VoxError::Transport(e.to_string()))?;
        log::info!("websocket connected to {}", self.config.url);

        let (sink, mut reader) = stream.split();
        *self.writer.lock().await = Some(sink);
        self.connected.store(true, Ordering::SeqCst);

        let cancel = self.fresh_cancel_token();
        let handlers = self.handlers.clone();
        let connected = self.connected.clone();
        let audio_opened = self.audio_opened.clone();
        let session_id = self.session_id.clone();
        let hello_notify = self.hello_notify.clone();

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = reader.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let Some(parsed) = parse_server_message(text.as_str()) else {
                            continue;
                        };
                        match parsed {
                            ServerMessage::Hello {
                                transport,
                                session_id: session,
                                ..
                            } => {
                                if let Some(transport) = &transport {
                                    if transport != "websocket" {
                                        log::warn!("server hello names transport {transport}");
                                    }
                                }
                                *session_id.lock().unwrap_or_else(|e| e.into_inner()) = session;
                                audio_opened.store(true, Ordering::SeqCst);
                                hello_notify.notify_waiters();
                                if let Some(handlers) = current_handlers(&handlers) {
                                    (handlers.on_audio_channel_opened)();
                                }
                            }
                            other => {
                                if let Some(handlers) = current_handlers(&handlers) {
                                    (handlers.on_incoming_json)(other);
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if let Some(handlers) = current_handlers(&handlers) {
                            (handlers.on_incoming_audio)(data.as_slice().to_vec());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("websocket closed by server");
                        connected.store(false, Ordering::SeqCst);
                        audio_opened.store(false, Ordering::SeqCst);
                        if let Some(handlers) = current_handlers(&handlers) {
                            (handlers.on_audio_channel_closed)();
                        }
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("websocket read failed: {e}");
                        connected.store(false, Ordering::SeqCst);
                        audio_opened.store(false, Ordering::SeqCst);
                        if let Some(handlers) = current_handlers(&handlers) {
                            (handlers.on_network_error)(e.to_string());
                            (handlers.on_audio_channel_closed)();
                        }
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn open_audio_channel(&self) -> Result<()> {
        if self.is_audio_channel_opened() {
            return Ok(());
        }
        if !self.is_connected() {
            self.connect().await?;
        }

        // Register for the hello notification before sending ours so a fast
        // server reply cannot slip past the waiter.
        let notified = self.hello_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        self.send_raw(Message::Text(message::client_hello("websocket").into()))
            .await?;

        tokio::time::timeout(self.config.handshake_timeout, notified)
            .await
            .map_err(|_| VoxError::HandshakeTimeout(self.config.handshake_timeout))?;
        log::info!(
            "audio channel open, session {}",
            self.session_id()
        );
        Ok(())
    }

    async fn close_audio_channel(&self) {
        self.cancel_reader();
        let mut guard = self.writer.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        drop(guard);
        let was_open = self.audio_opened.swap(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if was_open {
            if let Some(handlers) = current_handlers(&self.handlers) {
                (handlers.on_audio_channel_closed)();
            }
        }
    }

    async fn send_audio(&self, packet: Vec<u8>) -> Result<()> {
        if !self.is_audio_channel_opened() {
            return Err(VoxError::NotReady("audio channel not open".into()));
        }
        self.send_raw(Message::Binary(packet.into())).await
    }

    async fn send_json(&self, payload: String) -> Result<()> {
        self.send_raw(Message::Text(payload.into())).await
    }

    fn session_id(&self) -> String {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.audio_opened.load(Ordering::SeqCst) && self.is_connected()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_fail_cleanly_before_connect() {
        let client = WebSocketClient::new(WebSocketConfig::new(
            "ws://localhost:1/voice/v1/",
            "00:11:22:33:44:55",
        ));
        assert!(!client.is_connected());
        assert!(!client.is_audio_channel_opened());
        assert_eq!(client.session_id(), "");

        let result = client.send_json(message::listen_stop("")).await;
        assert!(matches!(result, Err(VoxError::NotReady(_))));

        let result = client.send_audio(vec![0u8; 8]).await;
        assert!(matches!(result, Err(VoxError::NotReady(_))));
    }

    #[tokio::test]
    async fn connect_to_unreachable_host_is_a_transport_error() {
        let client = WebSocketClient::new(WebSocketConfig::new(
            "ws://127.0.0.1:1/voice/v1/",
            "00:11:22:33:44:55",
        ));
        let result = client.connect().await;
        assert!(matches!(result, Err(VoxError::Transport(_))));
        assert!(!client.is_connected());
    }
}
