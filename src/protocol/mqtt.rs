//! MQTT transport: JSON control messages ride MQTT publishes while audio
//! packets take a separate UDP socket. Used on networks where a long-lived
//! WebSocket is impractical.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio_util::sync::CancellationToken;

use super::{
    current_handlers, handlers_slot, message, parse_server_message, ProtocolClient,
    ProtocolHandlers, ServerMessage, SharedHandlers,
};
use crate::error::{Result, VoxError};

use async_trait::async_trait;

pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Topic this device publishes control messages to.
    pub publish_topic: String,
    /// Topic the server answers on.
    pub subscribe_topic: String,
    /// Remote endpoint for the audio datagrams.
    pub udp_addr: String,
    pub keepalive: Duration,
    pub handshake_timeout: Duration,
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16, device_id: &str) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: format!("voxbridge-{device_id}"),
            username: None,
            password: None,
            publish_topic: format!("voxbridge/{device_id}/up"),
            subscribe_topic: format!("voxbridge/{device_id}/down"),
            udp_addr: String::new(),
            keepalive: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

pub struct MqttClient {
    config: MqttConfig,
    handlers: SharedHandlers,
    client: TokioMutex<Option<AsyncClient>>,
    udp: TokioMutex<Option<Arc<UdpSocket>>>,
    connected: Arc<AtomicBool>,
    audio_opened: Arc<AtomicBool>,
    session_id: Arc<StdMutex<Option<String>>>,
    connack_notify: Arc<Notify>,
    hello_notify: Arc<Notify>,
    cancel: StdMutex<CancellationToken>,
}

impl MqttClient {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            handlers: handlers_slot(),
            client: TokioMutex::new(None),
            udp: TokioMutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            audio_opened: Arc::new(AtomicBool::new(false)),
            session_id: Arc::new(StdMutex::new(None)),
            connack_notify: Arc::new(Notify::new()),
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

    fn cancel_tasks(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }
}

#[async_trait]
impl ProtocolClient for MqttClient {
    fn set_handlers(&self, handlers: ProtocolHandlers) {
        *self.handlers.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handlers));
    }

    async fn connect(&self) -> Result<()> {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keepalive);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user.as_str(), pass.expose_secret());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        client
            .subscribe(self.config.subscribe_topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| VoxError::Transport(e.to_string()))?;
        *self.client.lock().await = Some(client);

        let cancel = self.fresh_cancel_token();
        let handlers = self.handlers.clone();
        let connected = self.connected.clone();
        let audio_opened = self.audio_opened.clone();
        let session_id = self.session_id.clone();
        let connack_notify = self.connack_notify.clone();
        let hello_notify = self.hello_notify.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        log::info!("mqtt broker acknowledged connection");
                        connected.store(true, Ordering::SeqCst);
                        connack_notify.notify_one();
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let text = String::from_utf8_lossy(&publish.payload);
                        let Some(parsed) = parse_server_message(&text) else {
                            continue;
                        };
                        match parsed {
                            ServerMessage::Hello {
                                session_id: session,
                                ..
                            } => {
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
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("mqtt event loop failed: {e}");
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

        tokio::time::timeout(
            self.config.handshake_timeout,
            self.connack_notify.notified(),
        )
        .await
        .map_err(|_| VoxError::HandshakeTimeout(self.config.handshake_timeout))?;

        if !self.is_connected() {
            return Err(VoxError::Transport("mqtt connection rejected".into()));
        }
        log::info!(
            "mqtt connected to {}:{}",
            self.config.host,
            self.config.port
        );
        Ok(())
    }

    async fn open_audio_channel(&self) -> Result<()> {
        if self.is_audio_channel_opened() {
            return Ok(());
        }
        if !self.is_connected() {
            self.connect().await?;
        }
        if self.config.udp_addr.is_empty() {
            return Err(VoxError::NotReady("no udp audio endpoint configured".into()));
        }

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| VoxError::Transport(format!("udp bind failed: {e}")))?;
        socket
            .connect(&self.config.udp_addr)
            .await
            .map_err(|e| VoxError::Transport(format!("udp connect failed: {e}")))?;
        let socket = Arc::new(socket);
        *self.udp.lock().await = Some(socket.clone());

        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let handlers = self.handlers.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 4096];
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv(&mut buffer) => received,
                };
                match received {
                    Ok(len) => {
                        if let Some(handlers) = current_handlers(&handlers) {
                            (handlers.on_incoming_audio)(buffer[..len].to_vec());
                        }
                    }
                    Err(e) => {
                        log::warn!("udp receive failed: {e}");
                        break;
                    }
                }
            }
        });

        let notified = self.hello_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        self.send_json(message::client_hello("udp")).await?;

        tokio::time::timeout(self.config.handshake_timeout, notified)
            .await
            .map_err(|_| VoxError::HandshakeTimeout(self.config.handshake_timeout))?;
        log::info!("audio channel open, session {}", self.session_id());
        Ok(())
    }

    async fn close_audio_channel(&self) {
        self.cancel_tasks();
        if let Some(client) = self.client.lock().await.take() {
            let _ = client.disconnect().await;
        }
        *self.udp.lock().await = None;
        let was_open = self.audio_opened.swap(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if was_open {
            if let Some(handlers) = current_handlers(&self.handlers) {
                (handlers.on_audio_channel_closed)();
            }
        }
    }

    async fn send_audio(&self, packet: Vec<u8>) -> Result<()> {
        let socket = {
            let guard = self.udp.lock().await;
            guard.clone()
        };
        let socket =
            socket.ok_or_else(|| VoxError::NotReady("audio channel not open".into()))?;
        socket
            .send(&packet)
            .await
            .map_err(|e| VoxError::Transport(format!("udp send failed: {e}")))?;
        Ok(())
    }

    async fn send_json(&self, payload: String) -> Result<()> {
        let client = {
            let guard = self.client.lock().await;
            guard.clone()
        };
        let client =
            client.ok_or_else(|| VoxError::NotReady("mqtt not connected".into()))?;
        client
            .publish(
                self.config.publish_topic.as_str(),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await
            .map_err(|e| {
                log::warn!("mqtt publish failed: {e}");
                if let Some(handlers) = current_handlers(&self.handlers) {
                    (handlers.on_network_error)(e.to_string());
                }
                VoxError::Transport(e.to_string())
            })?;
        Ok(())
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
        let client = MqttClient::new(MqttConfig::new("localhost", 1883, "00:11:22:33:44:55"));
        assert!(!client.is_connected());
        assert!(!client.is_audio_channel_opened());

        let result = client.send_json(message::listen_stop("")).await;
        assert!(matches!(result, Err(VoxError::NotReady(_))));

        let result = client.send_audio(vec![0u8; 8]).await;
        assert!(matches!(result, Err(VoxError::NotReady(_))));
    }

    #[test]
    fn config_derives_topics_from_device_id() {
        let config = MqttConfig::new("broker.local", 1883, "aa:bb");
        assert_eq!(config.publish_topic, "voxbridge/aa:bb/up");
        assert_eq!(config.subscribe_topic, "voxbridge/aa:bb/down");
        assert!(config.client_id.starts_with("voxbridge-"));
    }
}
