//! Wire protocol for the voice assistant service

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::voice::codec::{decode_base64, pcm16_to_float};
use crate::voice::{AudioChunk, PLAYBACK_SAMPLE_RATE};
use crate::{Error, Result};

/// Session parameters sent in the `init` message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    /// Assistant voice
    pub voice_preset: String,
    /// Training module to run
    pub module: String,
    /// Tenant the session belongs to
    pub tenant_id: String,
    /// Display name used by the assistant
    pub restaurant_name: String,
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open the session
    Init(InitParams),
    /// One base64 PCM16 frame of user audio
    Audio {
        /// Base64 little-endian PCM16 at 16kHz
        data: String,
    },
    /// The user finished speaking
    EndOfTurn,
    /// Typed user turn
    Text {
        /// Message text
        text: String,
    },
    /// The user barged in; stop generating
    Interrupt,
}

impl ClientMessage {
    /// Serialize to the JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Message type tag, for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Audio { .. } => "audio",
            Self::EndOfTurn => "end_of_turn",
            Self::Text { .. } => "text",
            Self::Interrupt => "interrupt",
        }
    }
}

/// Classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Handshake accepted
    Connected,
    /// Assistant audio as raw PCM16 bytes
    AudioChunk {
        /// Little-endian PCM16
        pcm: Vec<u8>,
        /// Sample rate in Hz
        sample_rate_hz: u32,
    },
    /// Assistant text
    Text(String),
    /// Structured call the host should act on
    FunctionCall {
        /// Function name
        name: String,
        /// Parsed arguments
        args: Map<String, Value>,
    },
    /// The assistant finished its response
    TurnComplete,
    /// The server cut the response short
    Interrupted,
    /// Server-side or connection failure
    Error(String),
}

impl StreamMessage {
    /// Message type tag, for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::AudioChunk { .. } => "audio",
            Self::Text(_) => "text",
            Self::FunctionCall { .. } => "function_call",
            Self::TurnComplete => "turn_complete",
            Self::Interrupted => "interrupted",
            Self::Error(_) => "error",
        }
    }

    /// Wrap a raw binary PCM16 frame
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the payload has an odd byte count
    pub fn from_pcm(pcm: Vec<u8>) -> Result<Self> {
        if pcm.len() % 2 != 0 {
            return Err(Error::Protocol(format!(
                "binary audio frame has odd length {}",
                pcm.len()
            )));
        }
        Ok(Self::AudioChunk {
            pcm,
            sample_rate_hz: PLAYBACK_SAMPLE_RATE,
        })
    }
}

/// Decode PCM16 bytes into a playable chunk
///
/// # Errors
///
/// Returns a protocol error if the payload is not whole samples
pub fn decode_audio(pcm: &[u8], sample_rate_hz: u32) -> Result<AudioChunk> {
    Ok(AudioChunk::new(pcm16_to_float(pcm)?, sample_rate_hz))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Connected,
    Audio {
        data: String,
        #[serde(default, rename = "sampleRate")]
        sample_rate: Option<u32>,
    },
    Text {
        text: String,
    },
    FunctionCall {
        function: FunctionPayload,
    },
    TurnComplete,
    Interrupted,
    Error {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct FunctionPayload {
    name: String,
    #[serde(default)]
    args: Value,
}

/// Parse a JSON text frame from the server
///
/// # Errors
///
/// Returns a protocol error for malformed JSON, unknown message types,
/// undecodable audio, or function arguments that are not an object
pub fn parse_server_message(text: &str) -> Result<StreamMessage> {
    let frame: ServerFrame = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("invalid server message: {e}")))?;

    Ok(match frame {
        ServerFrame::Connected => StreamMessage::Connected,
        ServerFrame::Audio { data, sample_rate } => {
            let pcm = decode_base64(&data)?;
            if pcm.len() % 2 != 0 {
                return Err(Error::Protocol(format!(
                    "audio payload has odd length {}",
                    pcm.len()
                )));
            }
            StreamMessage::AudioChunk {
                pcm,
                sample_rate_hz: sample_rate
                    .filter(|&rate| rate > 0)
                    .unwrap_or(PLAYBACK_SAMPLE_RATE),
            }
        }
        ServerFrame::Text { text } => StreamMessage::Text(text),
        ServerFrame::FunctionCall { function } => StreamMessage::FunctionCall {
            args: parse_args(function.args)?,
            name: function.name,
        },
        ServerFrame::TurnComplete => StreamMessage::TurnComplete,
        ServerFrame::Interrupted => StreamMessage::Interrupted,
        ServerFrame::Error { error, message } => StreamMessage::Error(
            error
                .or(message)
                .unwrap_or_else(|| "unknown server error".to_string()),
        ),
    })
}

/// Normalize function arguments; some servers send them as a JSON string
fn parse_args(args: Value) -> Result<Map<String, Value>> {
    match args {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        Value::String(raw) if raw.trim().is_empty() => Ok(Map::new()),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(Error::Protocol(format!(
                "function args must be an object, got {other}"
            ))),
            Err(e) => Err(Error::Protocol(format!("function args are not json: {e}"))),
        },
        other => Err(Error::Protocol(format!(
            "function args must be an object, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::voice::codec::encode_base64;

    #[test]
    fn init_uses_camel_case_fields() {
        let msg = ClientMessage::Init(InitParams {
            voice_preset: "warm".to_string(),
            module: "menu".to_string(),
            tenant_id: "t-1".to_string(),
            restaurant_name: "Chez Test".to_string(),
        });
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "init",
                "voicePreset": "warm",
                "module": "menu",
                "tenantId": "t-1",
                "restaurantName": "Chez Test",
            })
        );
    }

    #[test]
    fn unit_messages_carry_only_type() {
        assert_eq!(ClientMessage::EndOfTurn.to_json().unwrap(), r#"{"type":"end_of_turn"}"#);
        assert_eq!(ClientMessage::Interrupt.to_json().unwrap(), r#"{"type":"interrupt"}"#);
    }

    #[test]
    fn audio_defaults_to_24k() {
        let data = encode_base64(&[0, 0, 1, 0]);
        let msg = parse_server_message(&format!(r#"{{"type":"audio","data":"{data}"}}"#)).unwrap();
        assert_eq!(
            msg,
            StreamMessage::AudioChunk {
                pcm: vec![0, 0, 1, 0],
                sample_rate_hz: 24_000
            }
        );
    }

    #[test]
    fn audio_honors_sample_rate() {
        let data = encode_base64(&[0, 0]);
        let msg = parse_server_message(&format!(
            r#"{{"type":"audio","data":"{data}","sampleRate":16000}}"#
        ))
        .unwrap();
        assert!(matches!(msg, StreamMessage::AudioChunk { sample_rate_hz: 16_000, .. }));
    }

    #[test]
    fn function_call_args_object_or_string() {
        let direct = parse_server_message(
            r#"{"type":"function_call","function":{"name":"show_item","args":{"id":7}}}"#,
        )
        .unwrap();
        let encoded = parse_server_message(
            r#"{"type":"function_call","function":{"name":"show_item","args":"{\"id\":7}"}}"#,
        )
        .unwrap();
        assert_eq!(direct, encoded);

        let StreamMessage::FunctionCall { name, args } = direct else {
            panic!("expected function call");
        };
        assert_eq!(name, "show_item");
        assert_eq!(args.get("id"), Some(&json!(7)));
    }

    #[test]
    fn function_call_without_args_is_empty() {
        let msg = parse_server_message(r#"{"type":"function_call","function":{"name":"next"}}"#)
            .unwrap();
        assert_eq!(
            msg,
            StreamMessage::FunctionCall {
                name: "next".to_string(),
                args: Map::new()
            }
        );
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        for raw in [
            "not json",
            r#"{"type":"mystery"}"#,
            r#"{"type":"audio","data":"!!!"}"#,
            r#"{"type":"function_call","function":{"name":"x","args":"[1,2]"}}"#,
        ] {
            assert!(
                matches!(parse_server_message(raw), Err(Error::Protocol(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn error_frame_text() {
        assert_eq!(
            parse_server_message(r#"{"type":"error","error":"quota exceeded"}"#).unwrap(),
            StreamMessage::Error("quota exceeded".to_string())
        );
    }

    #[test]
    fn raw_pcm_must_be_whole_samples() {
        assert!(StreamMessage::from_pcm(vec![0, 1, 2]).is_err());
        let chunk = decode_audio(&[0, 0, 0, 0x40], 24_000).unwrap();
        assert_eq!(chunk.samples.len(), 2);
    }
}
