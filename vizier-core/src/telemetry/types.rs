use serde::{Deserialize, Serialize};

/// Structured record of one finished (or failed) chat turn.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TurnLog {
    /// Provider identifier, e.g. "dify".
    pub provider: Option<String>,
    pub session_id: Option<String>,
    /// "event_stream", "chunked" or "blocking".
    pub transport: Option<String>,

    /// Conversation id the session ended up bound to.
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    /// Provider's returned request id/correlation id.
    pub provider_request_id: Option<String>,

    pub latency_ms: Option<u64>,
    /// Records decoded from the response body (streaming turns only).
    pub records: Option<u64>,
    pub text_len: Option<u64>,

    pub tokens_prompt: Option<u32>,
    pub tokens_completion: Option<u32>,
    pub tokens_total: Option<u32>,

    /// Optional error metadata, if applicable.
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl TurnLog {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn provider(mut self, v: &str) -> Self {
        self.provider = Some(v.to_string());
        self
    }
    pub fn session_id(mut self, v: &str) -> Self {
        self.session_id = Some(v.to_string());
        self
    }
    pub fn transport(mut self, v: &str) -> Self {
        self.transport = Some(v.to_string());
        self
    }
    pub fn conversation_id_opt(mut self, v: Option<&str>) -> Self {
        self.conversation_id = v.map(|s| s.to_string());
        self
    }
    pub fn message_id_opt(mut self, v: Option<&str>) -> Self {
        self.message_id = v.map(|s| s.to_string());
        self
    }
    pub fn provider_request_id_opt(mut self, v: Option<&str>) -> Self {
        self.provider_request_id = v.map(|s| s.to_string());
        self
    }
    pub fn latency_ms(mut self, v: u64) -> Self {
        self.latency_ms = Some(v);
        self
    }
    pub fn records(mut self, v: u64) -> Self {
        self.records = Some(v);
        self
    }
    pub fn text_len(mut self, v: usize) -> Self {
        self.text_len = Some(v as u64);
        self
    }
    pub fn tokens(mut self, p: Option<u32>, c: Option<u32>, t: Option<u32>) -> Self {
        self.tokens_prompt = p;
        self.tokens_completion = c;
        self.tokens_total = t;
        self
    }
    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error_kind.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn turn_log_serializes() {
        let log = TurnLog::new()
            .provider("dify")
            .session_id("s1")
            .transport("event_stream")
            .conversation_id_opt(Some("c1"))
            .latency_ms(42)
            .records(3)
            .text_len(12)
            .tokens(Some(10), Some(20), Some(30));

        assert!(!log.is_error());
        let as_json = serde_json::to_value(&log).unwrap();
        assert_eq!(as_json["provider"], json!("dify"));
        assert_eq!(as_json["conversation_id"], json!("c1"));
        assert_eq!(as_json["latency_ms"], json!(42));
        assert_eq!(as_json["tokens_total"], json!(30));
        assert_eq!(as_json["error_kind"], json!(null));

        let failed = log.error("provider", "quota");
        assert!(failed.is_error());
        assert_eq!(failed.error_message.as_deref(), Some("quota"));
    }
}
