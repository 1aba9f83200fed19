//! Voxflow wire protocol.
//!
//! All client communication uses JSON-over-WebSocket with a single envelope
//! shape `{type, session_id, timestamp, data}` and five frame families:
//! audio_stream, command, response, status, and error. Binary audio travels
//! as base64 text inside the envelope; raw byte arrays are rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Processing stage of the pipeline, used for response tagging and error
/// classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Asr,
    Llm,
    Tts,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asr => "asr",
            Self::Llm => "llm",
            Self::Tts => "tts",
        }
    }

    /// Wire error code when this stage fails.
    pub fn failure_code(self) -> &'static str {
        match self {
            Self::Asr => "ASR_FAILED",
            Self::Llm => "LLM_FAILED",
            Self::Tts => "TTS_FAILED",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    AudioStream,
    Command,
    Response,
    Status,
    Error,
}

/// Known audio encodings on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    #[default]
    Pcm16khz16bit,
    Wav,
    Mp3,
    Opus,
}

/// Interaction mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Continuous,
    #[default]
    Single,
    Wakeword,
    Interrupt,
}

impl SessionMode {
    pub fn from_str_mode(s: &str) -> Option<Self> {
        match s {
            "continuous" => Some(Self::Continuous),
            "single" => Some(Self::Single),
            "wakeword" => Some(Self::Wakeword),
            "interrupt" => Some(Self::Interrupt),
            _ => None,
        }
    }
}

/// Session state as reported in status frames. Includes the two
/// connection-level pseudo-states that never appear in the FSM itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireState {
    Idle,
    Listening,
    Processing,
    Speaking,
    Error,
    Connected,
    Disconnected,
}

/// Commands a client may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    StartSession,
    StopSession,
    Pause,
    Resume,
    SetMode,
    GetStatus,
    Interrupt,
    ClearContext,
}

impl CommandKind {
    pub fn from_str_command(s: &str) -> Option<Self> {
        match s {
            "start_session" => Some(Self::StartSession),
            "stop_session" => Some(Self::StopSession),
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "set_mode" => Some(Self::SetMode),
            "get_status" => Some(Self::GetStatus),
            "interrupt" => Some(Self::Interrupt),
            "clear_context" => Some(Self::ClearContext),
            _ => None,
        }
    }
}

mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => ser.serialize_some(&STANDARD.encode(b)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(de)?;
        match s {
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Payload of an `audio_stream` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioPayload {
    #[serde(default)]
    pub format: AudioFormat,
    pub chunk_id: u64,
    #[serde(default)]
    pub is_final: bool,
    #[serde(with = "b64")]
    pub audio_data: Vec<u8>,
}

/// Payload of a `command` frame, already dispatched to a known command.
#[derive(Debug, Clone)]
pub struct CommandPayload {
    pub command: CommandKind,
    pub mode: Option<SessionMode>,
    pub parameters: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawCommandPayload {
    command: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    parameters: Option<serde_json::Value>,
}

/// Payload of a `response` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub stage: Stage,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_delta: bool,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Payload of a `status` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: WireState,
    pub mode: SessionMode,
    pub concurrent_streams: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_info: Option<SessionInfo>,
}

/// Session details embedded in `get_status` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub conversation_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: usize,
    /// Session age in seconds.
    pub duration: i64,
}

/// Payload of an `error` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// The wire envelope. `data` stays untyped until dispatched by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub session_id: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: MessageType, session_id: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn response(session_id: impl Into<String>, payload: ResponsePayload) -> Self {
        Self::new(MessageType::Response, session_id, payload)
    }

    pub fn status(session_id: impl Into<String>, payload: StatusPayload) -> Self {
        Self::new(MessageType::Status, session_id, payload)
    }

    pub fn error(session_id: impl Into<String>, payload: ErrorPayload) -> Self {
        Self::new(MessageType::Error, session_id, payload)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and validate an inbound frame. Never yields a partially-valid
    /// envelope: type, session_id, and data must all be present and well
    /// formed.
    pub fn decode(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| GatewayError::MalformedFrame(format!("not valid JSON: {e}")))?;

        let kind_str = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::MalformedFrame("missing field `type`".into()))?;
        let kind: MessageType =
            serde_json::from_value(serde_json::Value::String(kind_str.to_string()))
                .map_err(|_| GatewayError::UnsupportedMessageType(kind_str.to_string()))?;

        let session_id = value
            .get("session_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GatewayError::MalformedFrame("missing field `session_id`".into()))?
            .to_string();

        let timestamp = value
            .get("timestamp")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        let data = match value.get("data") {
            Some(d) if !d.is_null() => d.clone(),
            _ => return Err(GatewayError::MalformedFrame("missing field `data`".into())),
        };

        Ok(Self {
            kind,
            session_id,
            timestamp,
            data,
        })
    }

    /// Parse the payload of an `audio_stream` frame.
    pub fn audio_payload(&self) -> Result<AudioPayload> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| GatewayError::InvalidAudio(e.to_string()))
    }

    /// Parse the payload of a `command` frame.
    pub fn command_payload(&self) -> Result<CommandPayload> {
        let raw: RawCommandPayload = serde_json::from_value(self.data.clone())
            .map_err(|e| GatewayError::InvalidCommand(e.to_string()))?;
        let command = CommandKind::from_str_command(&raw.command)
            .ok_or_else(|| GatewayError::UnsupportedCommand(raw.command.clone()))?;
        let mode = match raw.mode.as_deref() {
            None | Some("") => None,
            Some(m) => Some(
                SessionMode::from_str_mode(m)
                    .ok_or_else(|| GatewayError::InvalidCommand(format!("unknown mode: {m}")))?,
            ),
        };
        Ok(CommandPayload {
            command,
            mode,
            parameters: raw.parameters,
        })
    }

    pub fn response_payload(&self) -> Result<ResponsePayload> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| GatewayError::MalformedFrame(e.to_string()))
    }

    pub fn status_payload(&self) -> Result<StatusPayload> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| GatewayError::MalformedFrame(e.to_string()))
    }

    pub fn error_payload(&self) -> Result<ErrorPayload> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| GatewayError::MalformedFrame(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_roundtrip() {
        let payload = AudioPayload {
            format: AudioFormat::Pcm16khz16bit,
            chunk_id: 7,
            is_final: true,
            audio_data: vec![1, 2, 3, 4],
        };
        let env = Envelope::new(MessageType::AudioStream, "s1", &payload);
        let text = env.encode().unwrap();

        // Audio must travel as a base64 string, not a JSON byte array.
        let raw: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(raw["data"]["audio_data"].is_string());

        let decoded = Envelope::decode(&text).unwrap();
        assert_eq!(decoded.kind, MessageType::AudioStream);
        assert_eq!(decoded.session_id, "s1");
        let audio = decoded.audio_payload().unwrap();
        assert_eq!(audio.chunk_id, 7);
        assert!(audio.is_final);
        assert_eq!(audio.audio_data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn command_roundtrip() {
        let env = Envelope::new(
            MessageType::Command,
            "s1",
            serde_json::json!({"command": "start_session", "mode": "continuous"}),
        );
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        let cmd = decoded.command_payload().unwrap();
        assert_eq!(cmd.command, CommandKind::StartSession);
        assert_eq!(cmd.mode, Some(SessionMode::Continuous));
    }

    #[test]
    fn response_roundtrip() {
        let payload = ResponsePayload {
            stage: Stage::Tts,
            content: String::new(),
            confidence: Some(1.0),
            is_final: true,
            is_delta: false,
            audio_data: Some(vec![9; 16]),
            metadata: None,
        };
        let env = Envelope::response("s1", payload);
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        let resp = decoded.response_payload().unwrap();
        assert_eq!(resp.stage, Stage::Tts);
        assert_eq!(resp.audio_data.as_deref(), Some(&[9u8; 16][..]));
    }

    #[test]
    fn status_and_error_roundtrip() {
        let status = Envelope::status(
            "s1",
            StatusPayload {
                state: WireState::Listening,
                mode: SessionMode::Continuous,
                concurrent_streams: 2,
                session_info: None,
            },
        );
        let decoded = Envelope::decode(&status.encode().unwrap()).unwrap();
        assert_eq!(decoded.status_payload().unwrap().state, WireState::Listening);

        let error = Envelope::error(
            "s1",
            ErrorPayload {
                code: "LLM_FAILED".into(),
                message: "timeout".into(),
                recoverable: true,
                details: None,
            },
        );
        let decoded = Envelope::decode(&error.encode().unwrap()).unwrap();
        let payload = decoded.error_payload().unwrap();
        assert_eq!(payload.code, "LLM_FAILED");
        assert!(payload.recoverable);
    }

    #[test]
    fn decode_rejects_missing_fields() {
        assert!(matches!(
            Envelope::decode(r#"{"session_id":"s1","data":{}}"#),
            Err(GatewayError::MalformedFrame(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"type":"command","data":{}}"#),
            Err(GatewayError::MalformedFrame(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"type":"command","session_id":"s1"}"#),
            Err(GatewayError::MalformedFrame(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"type":"command","session_id":"","data":{}}"#),
            Err(GatewayError::MalformedFrame(_))
        ));
        assert!(matches!(
            Envelope::decode("not json"),
            Err(GatewayError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = Envelope::decode(r#"{"type":"video","session_id":"s1","data":{}}"#).unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedMessageType(t) if t == "video"));
    }

    #[test]
    fn audio_rejects_bad_base64() {
        let env = Envelope::decode(
            r#"{"type":"audio_stream","session_id":"s1","data":{"chunk_id":1,"audio_data":"%%%"}}"#,
        )
        .unwrap();
        assert!(matches!(
            env.audio_payload(),
            Err(GatewayError::InvalidAudio(_))
        ));
    }

    #[test]
    fn audio_rejects_byte_array_form() {
        // Open question resolved: only the base64 string form is canonical.
        let env = Envelope::decode(
            r#"{"type":"audio_stream","session_id":"s1","data":{"chunk_id":1,"audio_data":[1,2,3]}}"#,
        )
        .unwrap();
        assert!(matches!(
            env.audio_payload(),
            Err(GatewayError::InvalidAudio(_))
        ));
    }

    #[test]
    fn audio_format_defaults() {
        let env = Envelope::decode(
            r#"{"type":"audio_stream","session_id":"s1","data":{"chunk_id":1,"audio_data":"AAA="}}"#,
        )
        .unwrap();
        let audio = env.audio_payload().unwrap();
        assert_eq!(audio.format, AudioFormat::Pcm16khz16bit);
        assert!(!audio.is_final);
    }

    #[test]
    fn unknown_command_is_classified() {
        let env = Envelope::new(
            MessageType::Command,
            "s1",
            serde_json::json!({"command": "warp_drive"}),
        );
        assert!(matches!(
            env.command_payload(),
            Err(GatewayError::UnsupportedCommand(c)) if c == "warp_drive"
        ));
    }

    #[test]
    fn unknown_mode_is_invalid_command() {
        let env = Envelope::new(
            MessageType::Command,
            "s1",
            serde_json::json!({"command": "set_mode", "mode": "turbo"}),
        );
        assert!(matches!(
            env.command_payload(),
            Err(GatewayError::InvalidCommand(_))
        ));
    }
}
