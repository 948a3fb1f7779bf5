//! Span/log field names for chat turns.
//! Keep these stable; changing them is a breaking change for dashboards.

/// Name of the span wrapping one `chat` call.
pub const SPAN_CHAT_TURN: &str = "vizier.chat_turn";

pub const KEY_PROVIDER: &str = "llm.provider";
pub const KEY_SESSION_ID: &str = "session.id";
pub const KEY_TRANSPORT: &str = "transport";
pub const KEY_CONVERSATION_ID: &str = "conversation.id";
pub const KEY_PROVIDER_REQUEST_ID: &str = "llm.req_id";

pub const KEY_LATENCY_MS: &str = "latency.ms";
pub const KEY_RECORDS: &str = "records";
pub const KEY_TEXT_LEN: &str = "text.len";

/// Error-related (if applicable)
pub const KEY_ERROR_KIND: &str = "error.kind";
