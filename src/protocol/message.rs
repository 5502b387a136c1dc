//! JSON control messages exchanged with the server.
//!
//! Everything rides on a `"type"` discriminator. Outbound messages are built
//! with small helper functions rather than a mirrored enum; the set is tiny
//! and half of the fields are optional depending on context.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::codec::{CHANNELS, FRAME_DURATION, SAMPLE_RATE};
use crate::state::{AbortReason, ListeningMode};

pub const PROTOCOL_VERSION: u8 = 1;

/// Audio framing announced during the hello exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: u64,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".into(),
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            frame_duration: FRAME_DURATION.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    Stop,
}

/// Inbound control message. Anything with an unrecognized `"type"` lands in
/// [`ServerMessage::Unknown`] and is logged, never treated as an error.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello {
        transport: Option<String>,
        session_id: Option<String>,
        audio_params: Option<AudioParams>,
    },
    Tts {
        state: TtsState,
        #[serde(default)]
        text: Option<String>,
    },
    Stt {
        #[serde(default)]
        text: String,
    },
    Llm {
        #[serde(default)]
        emotion: String,
    },
    #[serde(other)]
    Unknown,
}

pub fn client_hello(transport: &str) -> String {
    json!({
        "type": "hello",
        "version": PROTOCOL_VERSION,
        "transport": transport,
        "audio_params": AudioParams::default(),
    })
    .to_string()
}

pub fn listen_start(session_id: &str, mode: ListeningMode) -> String {
    json!({
        "session_id": session_id,
        "type": "listen",
        "state": "start",
        "mode": mode.wire_name(),
    })
    .to_string()
}

pub fn listen_stop(session_id: &str) -> String {
    json!({
        "session_id": session_id,
        "type": "listen",
        "state": "stop",
    })
    .to_string()
}

/// Reports a locally detected wake word (or typed text) to the server.
pub fn listen_detect(session_id: &str, text: &str) -> String {
    json!({
        "session_id": session_id,
        "type": "listen",
        "state": "detect",
        "text": text,
    })
    .to_string()
}

/// The `reason` key is only present when there is a concrete reason.
pub fn abort_speaking(session_id: &str, reason: AbortReason) -> String {
    let mut message = json!({
        "session_id": session_id,
        "type": "abort",
    });
    if let Some(reason) = reason.wire_name() {
        if let Value::Object(map) = &mut message {
            map.insert("reason".into(), Value::String(reason.into()));
        }
    }
    message.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_carries_audio_params() {
        let hello: Value = serde_json::from_str(&client_hello("websocket")).unwrap();
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["version"], 1);
        assert_eq!(hello["transport"], "websocket");
        assert_eq!(hello["audio_params"]["format"], "opus");
        assert_eq!(hello["audio_params"]["sample_rate"], 16000);
        assert_eq!(hello["audio_params"]["frame_duration"], 60);
    }

    #[test]
    fn listen_messages_use_wire_mode_names() {
        let auto: Value =
            serde_json::from_str(&listen_start("s1", ListeningMode::AutoStop)).unwrap();
        assert_eq!(auto["mode"], "auto");

        let manual: Value =
            serde_json::from_str(&listen_start("s1", ListeningMode::Manual)).unwrap();
        assert_eq!(manual["mode"], "manual");

        let stop: Value = serde_json::from_str(&listen_stop("s1")).unwrap();
        assert_eq!(stop["state"], "stop");
        assert_eq!(stop["session_id"], "s1");
    }

    #[test]
    fn abort_reason_key_is_omitted_when_absent() {
        let with: Value =
            serde_json::from_str(&abort_speaking("s1", AbortReason::WakeWordDetected)).unwrap();
        assert_eq!(with["reason"], "wake_word_detected");

        let without: Value = serde_json::from_str(&abort_speaking("s1", AbortReason::None)).unwrap();
        assert!(without.get("reason").is_none());
    }

    #[test]
    fn parses_tts_lifecycle() {
        let start: ServerMessage =
            serde_json::from_str(r#"{"type":"tts","state":"start"}"#).unwrap();
        assert!(matches!(
            start,
            ServerMessage::Tts {
                state: TtsState::Start,
                text: None
            }
        ));

        let sentence: ServerMessage = serde_json::from_str(
            r#"{"type":"tts","state":"sentence_start","text":"hello there"}"#,
        )
        .unwrap();
        match sentence {
            ServerMessage::Tts { state, text } => {
                assert_eq!(state, TtsState::SentenceStart);
                assert_eq!(text.as_deref(), Some("hello there"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_stt_and_llm() {
        let stt: ServerMessage =
            serde_json::from_str(r#"{"type":"stt","text":"turn on the light"}"#).unwrap();
        assert!(matches!(stt, ServerMessage::Stt { text } if text == "turn on the light"));

        let llm: ServerMessage =
            serde_json::from_str(r#"{"type":"llm","emotion":"happy"}"#).unwrap();
        assert!(matches!(llm, ServerMessage::Llm { emotion } if emotion == "happy"));
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let message: ServerMessage =
            serde_json::from_str(r#"{"type":"iot","commands":[]}"#).unwrap();
        assert!(matches!(message, ServerMessage::Unknown));
    }

    #[test]
    fn server_hello_parses_with_partial_fields() {
        let hello: ServerMessage = serde_json::from_str(
            r#"{"type":"hello","transport":"websocket","session_id":"abc"}"#,
        )
        .unwrap();
        match hello {
            ServerMessage::Hello {
                transport,
                session_id,
                audio_params,
            } => {
                assert_eq!(transport.as_deref(), Some("websocket"));
                assert_eq!(session_id.as_deref(), Some("abc"));
                assert!(audio_params.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
