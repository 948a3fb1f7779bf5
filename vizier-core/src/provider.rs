use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{ChatError, CoreResult};
use crate::model::{ChatMessage, LlmModel, LlmUsage, SpeechOptions, TurnResponse};
use crate::stream::StreamTransport;

/// Capability marker for providers.
/// Used to advertise what verbs a provider supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Chat,
    ChatStream,
    Usage,
    Models,
    Speech,
}

/// `(partial_text, delta_text)` after each appended fragment.
pub type UpdateCallback = Box<dyn FnMut(&str, &str) + Send>;
/// `(final_text, response)` once per successful turn.
pub type FinishCallback = Box<dyn FnOnce(String, TurnResponse) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(ChatError) + Send>;
/// Receives the turn's cancellation token before any I/O starts.
pub type ControllerCallback = Box<dyn FnOnce(CancellationToken) + Send>;

/// Per-turn settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatConfig {
    /// Forces this conversation id instead of the stored binding.
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
    pub stream: bool,
    /// Streaming framing; `None` uses the provider default.
    pub transport: Option<StreamTransport>,
    pub inputs: Map<String, Value>,
}

/// Everything one `chat` call needs. Results come back through the callbacks.
pub struct ChatOptions {
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
    pub config: ChatConfig,
    pub on_update: Option<UpdateCallback>,
    pub on_finish: Option<FinishCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_controller: Option<ControllerCallback>,
}

impl ChatOptions {
    pub fn new(session_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            session_id: session_id.into(),
            messages,
            config: ChatConfig::default(),
            on_update: None,
            on_finish: None,
            on_error: None,
            on_controller: None,
        }
    }

    pub fn config(mut self, config: ChatConfig) -> Self {
        self.config = config;
        self
    }

    pub fn on_update(mut self, f: impl FnMut(&str, &str) + Send + 'static) -> Self {
        self.on_update = Some(Box::new(f));
        self
    }

    pub fn on_finish(mut self, f: impl FnOnce(String, TurnResponse) + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(ChatError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_controller(mut self, f: impl FnOnce(CancellationToken) + Send + 'static) -> Self {
        self.on_controller = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for ChatOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOptions")
            .field("session_id", &self.session_id)
            .field("messages", &self.messages.len())
            .field("config", &self.config)
            .field("on_update", &self.on_update.is_some())
            .field("on_finish", &self.on_finish.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_controller", &self.on_controller.is_some())
            .finish()
    }
}

/// The uniform interface a provider-agnostic dispatcher talks to.
#[async_trait]
pub trait LlmApi: Send + Sync {
    fn name(&self) -> &str;

    /// Run one chat turn. Errors go to `on_error` when it is set; otherwise
    /// they are returned.
    async fn chat(&self, options: ChatOptions) -> CoreResult<()>;

    async fn usage(&self) -> CoreResult<LlmUsage> {
        Ok(LlmUsage::default())
    }

    async fn models(&self) -> CoreResult<Vec<LlmModel>> {
        Ok(Vec::new())
    }

    async fn speech(&self, _options: SpeechOptions) -> CoreResult<Vec<u8>> {
        Err(ChatError::Unsupported("speech".into()))
    }
}

/// Providers can expose their supported capabilities
pub trait ProviderCaps {
    fn capabilities(&self) -> &'static [Capability];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    struct Echo;

    #[async_trait]
    impl LlmApi for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn chat(&self, options: ChatOptions) -> CoreResult<()> {
            let text = options
                .messages
                .last()
                .map(|m| m.text_content().to_string())
                .unwrap_or_default();
            if let Some(f) = options.on_finish {
                f(text, TurnResponse::default());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_stubs_are_empty_or_unsupported() {
        let api = Echo;
        assert_eq!(api.usage().await.unwrap(), LlmUsage { used: 0, total: 0 });
        assert!(api.models().await.unwrap().is_empty());
        let err = api
            .speech(SpeechOptions {
                model: "tts-1".into(),
                input: "hi".into(),
                voice: "alloy".into(),
                speed: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Unsupported(_)));
    }

    #[tokio::test]
    async fn options_builder_wires_callbacks() {
        let (tx, rx) = std::sync::mpsc::channel();
        let opts = ChatOptions::new("s1", vec![ChatMessage::new(Role::User, "ping")])
            .on_finish(move |text, _| tx.send(text).unwrap());
        assert!(format!("{opts:?}").contains("on_finish: true"));
        Echo.chat(opts).await.unwrap();
        assert_eq!(rx.recv().unwrap(), "ping");
    }
}
