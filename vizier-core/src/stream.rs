//! Streaming primitives exposed by vizier.
//!
//! Contract:
//! - Both streaming transports decode the response body into the same
//!   [`RecordStream`], one [`StreamRecord`] per logical provider record.
//! - A record is classified exactly once, at the decode boundary; callers
//!   match on the enum instead of comparing event strings.
//! - Malformed records never appear on the stream; the decoder logs and drops them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreResult;

/// Literal some providers send as the last payload of a stream.
pub const TERMINATOR: &str = "[DONE]";

/// Framing used for a streaming turn.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamTransport {
    /// Server-Sent Events.
    #[default]
    EventStream,
    /// Newline-delimited `data:` records over a plain response body.
    Chunked,
}

impl StreamTransport {
    /// Whether a close with zero records should be reported as an error.
    pub fn requires_event_before_close(self) -> bool {
        matches!(self, Self::EventStream)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EventStream => "event_stream",
            Self::Chunked => "chunked",
        }
    }
}

/// Loose shape of one JSON record as sent on the wire.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct WireRecord {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// One classified provider record.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    /// Incremental answer fragment (`message`, `agent_message`, or an untagged record with `answer`).
    Message {
        answer: String,
        conversation_id: Option<String>,
        message_id: Option<String>,
    },
    /// Successful end of the turn.
    MessageEnd {
        conversation_id: Option<String>,
        message_id: Option<String>,
        /// Unix seconds, when the provider sends it.
        created_at: Option<i64>,
        metadata: Value,
    },
    /// Provider-reported failure.
    Error {
        message: String,
        code: Option<String>,
        status: Option<u16>,
    },
    /// The terminator literal.
    Done,
    /// Anything else (`ping`, workflow progress, ...). Carries the conversation id if present.
    Other {
        event: Option<String>,
        conversation_id: Option<String>,
    },
}

impl StreamRecord {
    /// Parse one JSON payload. Returns `Err` for malformed JSON.
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        if payload == TERMINATOR {
            return Ok(Self::Done);
        }
        let wire: WireRecord = serde_json::from_str(payload)?;
        Ok(Self::from(wire))
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Message {
                conversation_id, ..
            }
            | Self::MessageEnd {
                conversation_id, ..
            }
            | Self::Other {
                conversation_id, ..
            } => conversation_id.as_deref(),
            Self::Error { .. } | Self::Done => None,
        }
    }
}

impl From<WireRecord> for StreamRecord {
    fn from(w: WireRecord) -> Self {
        match w.event.as_deref() {
            Some("message") | Some("agent_message") => Self::Message {
                answer: w.answer.unwrap_or_default(),
                conversation_id: w.conversation_id,
                message_id: w.message_id,
            },
            Some("message_end") => Self::MessageEnd {
                conversation_id: w.conversation_id,
                message_id: w.message_id,
                created_at: w.created_at,
                metadata: w.metadata.unwrap_or(Value::Null),
            },
            Some("error") => Self::Error {
                message: w.message.unwrap_or_else(|| "Unknown API error".to_string()),
                code: w.code,
                status: w.status,
            },
            None if w.answer.is_some() => Self::Message {
                answer: w.answer.unwrap_or_default(),
                conversation_id: w.conversation_id,
                message_id: w.message_id,
            },
            _ => Self::Other {
                event: w.event,
                conversation_id: w.conversation_id,
            },
        }
    }
}

/// Boxed stream of decoded records. Both streaming transports return this.
pub type RecordStream = futures::stream::BoxStream<'static, CoreResult<StreamRecord>>;

/// Boxed stream of raw body chunks, errors already mapped.
pub type ByteStream = futures::stream::BoxStream<'static, CoreResult<bytes::Bytes>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_event_tags() {
        let r = StreamRecord::parse(
            r#"{"event":"message","answer":"4","conversation_id":"c1","message_id":"m1"}"#,
        )
        .unwrap();
        assert_eq!(
            r,
            StreamRecord::Message {
                answer: "4".into(),
                conversation_id: Some("c1".into()),
                message_id: Some("m1".into()),
            }
        );
        assert_eq!(r.conversation_id(), Some("c1"));

        let r = StreamRecord::parse(r#"{"event":"agent_message","answer":"a"}"#).unwrap();
        assert!(matches!(r, StreamRecord::Message { ref answer, .. } if answer == "a"));

        let r = StreamRecord::parse(
            r#"{"event":"message_end","conversation_id":"c1","created_at":1705395332,"metadata":{"usage":{"total_tokens":3}}}"#,
        )
        .unwrap();
        match r {
            StreamRecord::MessageEnd {
                created_at,
                metadata,
                ..
            } => {
                assert_eq!(created_at, Some(1705395332));
                assert_eq!(metadata["usage"]["total_tokens"], json!(3))
            }
            other => panic!("expected MessageEnd, got {other:?}"),
        }

        let r = StreamRecord::parse(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(
            r,
            StreamRecord::Other {
                event: Some("ping".into()),
                conversation_id: None
            }
        );
    }

    #[test]
    fn untagged_answer_is_a_message() {
        let r = StreamRecord::parse(r#"{"answer":"Hel","conversation_id":"abc123"}"#).unwrap();
        assert!(matches!(r, StreamRecord::Message { ref answer, .. } if answer == "Hel"));
        assert_eq!(r.conversation_id(), Some("abc123"));

        let r = StreamRecord::parse(r#"{"conversation_id":"abc123"}"#).unwrap();
        assert_eq!(r.conversation_id(), Some("abc123"));
    }

    #[test]
    fn error_record_keeps_message_and_code() {
        let r = StreamRecord::parse(
            r#"{"event":"error","message":"Model quota exceeded","code":"provider_quota_exceeded","status":400}"#,
        )
        .unwrap();
        assert_eq!(r.conversation_id(), None);
        assert_eq!(
            r,
            StreamRecord::Error {
                message: "Model quota exceeded".into(),
                code: Some("provider_quota_exceeded".into()),
                status: Some(400),
            }
        );

        let r = StreamRecord::parse(r#"{"event":"error"}"#).unwrap();
        assert!(matches!(r, StreamRecord::Error { ref message, .. } if message == "Unknown API error"));
    }

    #[test]
    fn terminator_and_garbage() {
        assert_eq!(StreamRecord::parse("[DONE]").unwrap(), StreamRecord::Done);
        assert!(StreamRecord::parse("{not json").is_err());
    }

    #[test]
    fn transport_close_policy() {
        assert!(StreamTransport::EventStream.requires_event_before_close());
        assert!(!StreamTransport::Chunked.requires_event_before_close());
        assert_eq!(StreamTransport::default(), StreamTransport::EventStream);
    }
}
