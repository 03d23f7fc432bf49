//! Wire protocol for the audio socket.
//!
//! The client's first message is a JSON handshake; everything after it is
//! binary PCM. The server only ever sends JSON text messages, one object per
//! message, discriminated by a `type` field.

use serde::{Deserialize, Serialize};

/// First client message on a fresh connection.
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub lang: String,
    #[serde(default)]
    pub prompt: String,
}

impl Hello {
    pub fn parse(text: &str) -> Result<Self, WireError> {
        serde_json::from_str(text).map_err(|e| WireError::BadHandshake(e.to_string()))
    }
}

/// Server-to-client messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    VadResult {
        speech_detected: bool,
        speech_ended: bool,
        timestamp: f64,
    },
    RecognitionResult {
        timestamp: f64,
        result: RecognitionPayload,
    },
}

impl ServerMessage {
    pub fn speech_start(timestamp: f64) -> Self {
        ServerMessage::VadResult {
            speech_detected: true,
            speech_ended: false,
            timestamp,
        }
    }

    pub fn speech_end(timestamp: f64) -> Self {
        ServerMessage::VadResult {
            speech_detected: false,
            speech_ended: true,
            timestamp,
        }
    }

    pub fn to_json(&self) -> String {
        // Serialization of these enums cannot fail: no maps with non-string
        // keys, no non-finite float formatting options in play.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Either a transcription or a per-utterance error, as sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RecognitionPayload {
    Ok(Transcription),
    Err { error: WireErrorBody },
}

impl RecognitionPayload {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        RecognitionPayload::Err {
            error: WireErrorBody {
                kind,
                message: message.into(),
            },
        }
    }
}

/// Successful transcription of one utterance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Error kinds as they appear on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    BadHandshake,
    OddByteCount,
    Overloaded,
    Timeout,
    ModelFailure,
    StorageError,
}

/// Protocol-level failures that terminate or degrade a session.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed handshake: {0}")]
    BadHandshake(String),
    #[error("binary frame carries a trailing odd byte")]
    OddByteCount,
}

/// Number of zero bytes that make up the client's end-mark (3 s of zero
/// 16-bit samples at 16 kHz).
pub const END_MARK_BYTES: usize = 3 * 16000 * 2;

/// True if a binary frame is the distinguished "I'm done sending" payload.
pub fn is_end_mark(data: &[u8]) -> bool {
    data.len() >= END_MARK_BYTES && data.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_parses_with_and_without_prompt() {
        let h = Hello::parse(r#"{"lang":"en","prompt":"medical terms"}"#).unwrap();
        assert_eq!(h.lang, "en");
        assert_eq!(h.prompt, "medical terms");

        let h = Hello::parse(r#"{"lang":"de"}"#).unwrap();
        assert_eq!(h.lang, "de");
        assert!(h.prompt.is_empty());
    }

    #[test]
    fn hello_rejects_garbage() {
        assert!(Hello::parse("not json").is_err());
        assert!(Hello::parse(r#"{"prompt":"x"}"#).is_err());
    }

    #[test]
    fn vad_result_wire_shape() {
        let json = ServerMessage::speech_start(12.5).to_json();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "vad_result");
        assert_eq!(v["speech_detected"], true);
        assert_eq!(v["speech_ended"], false);
        assert_eq!(v["timestamp"], 12.5);
    }

    #[test]
    fn recognition_result_wire_shape() {
        let msg = ServerMessage::RecognitionResult {
            timestamp: 3.0,
            result: RecognitionPayload::Ok(Transcription {
                text: "hello world".into(),
                segments: vec![TranscriptSegment {
                    start: 0.0,
                    end: 1.2,
                    text: "hello world".into(),
                }],
                language: Some("en".into()),
            }),
        };
        let v: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(v["type"], "recognition_result");
        assert_eq!(v["result"]["text"], "hello world");
        assert_eq!(v["result"]["segments"][0]["end"], 1.2);
        assert_eq!(v["result"]["language"], "en");
    }

    #[test]
    fn error_result_wire_shape() {
        let msg = ServerMessage::RecognitionResult {
            timestamp: 0.0,
            result: RecognitionPayload::error(ErrorKind::Overloaded, "queue full"),
        };
        let v: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(v["result"]["error"]["kind"], "Overloaded");
        assert_eq!(v["result"]["error"]["message"], "queue full");
    }

    #[test]
    fn end_mark_detection() {
        assert!(is_end_mark(&vec![0u8; END_MARK_BYTES]));
        assert!(is_end_mark(&vec![0u8; END_MARK_BYTES + 2]));
        assert!(!is_end_mark(&vec![0u8; END_MARK_BYTES - 2]));

        let mut almost = vec![0u8; END_MARK_BYTES];
        almost[1000] = 1;
        assert!(!is_end_mark(&almost));
    }
}
