use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_USER: &str = "default-user";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Message body as produced by the chat UI: plain text or multimodal parts.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Plain text of the message: the string itself, or the first text part.
    pub fn text_content(&self) -> &str {
        match &self.content {
            MessageContent::Text(s) => s,
            MessageContent::Parts(parts) => parts
                .iter()
                .find_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .unwrap_or(""),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Streaming,
    #[default]
    Blocking,
}

/// Body of `POST /chat-messages`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatTurnRequest {
    pub query: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub response_mode: ResponseMode,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

impl ChatTurnRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user: DEFAULT_USER.to_string(),
            conversation_id: None,
            response_mode: ResponseMode::Blocking,
            inputs: Map::new(),
        }
    }
}

/// Token accounting found under `metadata.usage`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub total_price: Option<String>,
    pub currency: Option<String>,
    pub latency: Option<f64>,
}

/// Single JSON reply of a blocking turn.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BlockingResponse {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub metadata: Value,
}

/// Final metadata handed to `on_finish` alongside the accumulated text.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct TurnResponse {
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub created_at: Option<i64>,
    /// Provider metadata, passed through untouched.
    pub metadata: Value,
    pub provider_request_id: Option<String>,
    pub latency_ms: u32,
}

impl TurnResponse {
    pub fn usage(&self) -> Option<Usage> {
        let usage = self.metadata.get("usage")?;
        if usage.is_null() {
            return None;
        }
        serde_json::from_value(usage.clone()).ok()
    }
}

impl From<BlockingResponse> for TurnResponse {
    fn from(r: BlockingResponse) -> Self {
        Self {
            message_id: r.message_id,
            conversation_id: r.conversation_id,
            created_at: r.created_at,
            metadata: r.metadata,
            provider_request_id: None,
            latency_ms: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct LlmUsage {
    pub used: u64,
    pub total: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LlmModel {
    pub name: String,
    pub available: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SpeechOptions {
    pub model: String,
    pub input: String,
    pub voice: String,
    #[serde(default)]
    pub speed: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_omits_absent_conversation_id() {
        let req = ChatTurnRequest::new("2+2?");
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["query"], json!("2+2?"));
        assert_eq!(v["user"], json!("default-user"));
        assert_eq!(v["response_mode"], json!("blocking"));
        assert_eq!(v["inputs"], json!({}));
        assert!(v.get("conversation_id").is_none());

        let req = ChatTurnRequest {
            conversation_id: Some("abc123".into()),
            response_mode: ResponseMode::Streaming,
            ..ChatTurnRequest::new("hi")
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["conversation_id"], json!("abc123"));
        assert_eq!(v["response_mode"], json!("streaming"));
    }

    #[test]
    fn text_content_prefers_first_text_part() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}},
                {"type": "text", "text": "what is this?"},
                {"type": "text", "text": "ignored"}
            ]
        }))
        .unwrap();
        assert_eq!(msg.text_content(), "what is this?");

        let only_image = ChatMessage::user(MessageContent::Parts(vec![ContentPart::ImageUrl {
            image_url: ImageUrl { url: "u".into() },
        }]));
        assert_eq!(only_image.text_content(), "");
        assert_eq!(ChatMessage::user("  hi ").text_content(), "  hi ");
    }

    #[test]
    fn blocking_response_usage_is_typed() {
        let resp: BlockingResponse = serde_json::from_value(json!({
            "answer": "4",
            "message_id": "m1",
            "conversation_id": "c1",
            "created_at": 1705395332,
            "metadata": {"usage": {
                "prompt_tokens": 12, "completion_tokens": 1, "total_tokens": 13,
                "total_price": "0.0000135", "currency": "USD", "latency": 0.42
            }}
        }))
        .unwrap();
        let turn = TurnResponse::from(resp);
        let usage = turn.usage().expect("usage");
        assert_eq!(usage.total_tokens, 13);
        assert_eq!(usage.currency.as_deref(), Some("USD"));
        assert_eq!(turn.conversation_id.as_deref(), Some("c1"));

        let bare = TurnResponse {
            metadata: json!({"usage": null}),
            ..Default::default()
        };
        assert!(bare.usage().is_none());
    }
}
