use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};

use voxbridge::audio::cpal_device::{CpalDeviceConfig, CpalDuplexDevice};
use voxbridge::codec::OpusCodec;
use voxbridge::config::{Settings, TransportKind};
use voxbridge::display::ConsoleDisplay;
use voxbridge::engine::{Engine, EngineConfig, EngineParts};
use voxbridge::protocol::mqtt::{MqttClient, MqttConfig};
use voxbridge::protocol::websocket::{WebSocketClient, WebSocketConfig};
use voxbridge::protocol::ProtocolClient;
use voxbridge::state::AbortReason;
use voxbridge::wakeword::NullDetector;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportChoice {
    Websocket,
    Mqtt,
}

#[derive(Parser, Debug)]
#[command(name = "voxbridge", about = "Voice assistant edge client")]
struct Cli {
    /// Transport to the server; overrides VOX_TRANSPORT.
    #[arg(long, value_enum)]
    transport: Option<TransportChoice>,

    /// WebSocket endpoint; overrides VOX_SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,

    /// Device identity; overrides VOX_DEVICE_ID.
    #[arg(long)]
    device_id: Option<String>,

    /// Capture device name (default: system default input).
    #[arg(long)]
    input_device: Option<String>,

    /// Playback device name (default: system default output).
    #[arg(long)]
    output_device: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(device_id) = &cli.device_id {
        std::env::set_var("VOX_DEVICE_ID", device_id);
    }
    let mut settings = Settings::load()?;
    if let Some(url) = cli.server_url {
        settings.server_url = url;
    }
    let transport = match cli.transport {
        Some(TransportChoice::Websocket) => TransportKind::WebSocket,
        Some(TransportChoice::Mqtt) => TransportKind::Mqtt,
        None => settings.transport,
    };

    let protocol: Arc<dyn ProtocolClient> = match transport {
        TransportKind::WebSocket => {
            log::info!("🌐 using websocket transport ({})", settings.server_url);
            Arc::new(WebSocketClient::new(WebSocketConfig {
                url: settings.server_url.clone(),
                device_id: settings.device_id.clone(),
                client_id: settings.client_id.clone(),
                access_token: settings.access_token.take(),
                handshake_timeout: Duration::from_secs(10),
            }))
        }
        TransportKind::Mqtt => {
            log::info!(
                "🌐 using mqtt transport ({}:{})",
                settings.mqtt_host,
                settings.mqtt_port
            );
            let mut config = MqttConfig::new(
                settings.mqtt_host.clone(),
                settings.mqtt_port,
                &settings.device_id,
            );
            config.username = settings.mqtt_username.clone();
            config.password = settings.mqtt_password.take();
            config.udp_addr = settings.mqtt_udp_addr.clone();
            Arc::new(MqttClient::new(config))
        }
    };

    let device = CpalDuplexDevice::new(CpalDeviceConfig {
        input_device: cli.input_device,
        output_device: cli.output_device,
    })?;

    let mut engine = Engine::start(EngineParts {
        protocol,
        device: Box::new(device),
        codec: Box::new(OpusCodec::new()?),
        detector: Arc::new(NullDetector::new()),
        display: Arc::new(ConsoleDisplay),
        config: EngineConfig::default(),
    })?;

    engine.on_state_changed(|state| log::debug!("device is now {state}"));

    println!("🎙️  voxbridge ready");
    println!("   t         toggle conversation");
    println!("   m / p     press / release push-to-talk");
    println!("   x         abort current reply");
    println!("   q         quit");
    println!("   <text>    send a text message");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match line.trim() {
            "" => {}
            "t" => engine.toggle_chat_state(),
            "m" => engine.start_listening(),
            "p" => engine.stop_listening(),
            "x" => engine.abort_speaking(AbortReason::None),
            "q" => break,
            text => engine.send_text(text),
        }
    }

    log::info!("👋 shutting down");
    engine.shutdown();
    Ok(())
}
