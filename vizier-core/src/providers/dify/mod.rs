//! Dify `chat-messages` adapter.
//!
//! One `chat` call is one turn: resolve the conversation id for the session,
//! POST the query, decode the reply (SSE, chunked `data:` lines, or a single
//! blocking JSON body), and report through the caller's callbacks. Every
//! conversation id the provider sends is written to the store as soon as it
//! is seen, so the next turn continues the conversation even if this one
//! fails or is cancelled halfway.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info_span, warn};
use tracing_futures::Instrument;

use crate::config::Config;
use crate::decoder;
use crate::error::{ChatError, CoreResult};
use crate::http_client::HttpClient;
use crate::model::{
    BlockingResponse, ChatMessage, ChatTurnRequest, ResponseMode, Role, TurnResponse,
    DEFAULT_USER,
};
use crate::provider::{
    Capability, ChatConfig, ChatOptions, ErrorCallback, LlmApi, ProviderCaps, UpdateCallback,
};
use crate::store::ConversationStore;
use crate::stream::{RecordStream, StreamRecord, StreamTransport};
use crate::telemetry::{emit_turn, TurnLog};

pub const PROVIDER_NAME: &str = "dify";
const CHAT_PATH: &str = "chat-messages";

pub struct Dify {
    http: HttpClient,
    api_key: SecretString,
    base: String,
    name: String, // usually "dify"
    default_user: String,
    default_transport: StreamTransport,
    store: Arc<dyn ConversationStore>,
}

impl Dify {
    pub fn new(
        http: HttpClient,
        api_key: SecretString,
        base: impl Into<String>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            http,
            api_key,
            base: base.into(),
            name: PROVIDER_NAME.into(),
            default_user: DEFAULT_USER.into(),
            default_transport: StreamTransport::default(),
            store,
        }
    }

    /// Build from a loaded [`Config`]. A missing API key has already been
    /// logged by [`Config::api_key`]; requests then go out with an empty token
    /// and the provider's 401 surfaces as a transport error.
    pub fn from_config(cfg: &Config, store: Arc<dyn ConversationStore>) -> CoreResult<Self> {
        let http = HttpClient::new(&cfg.http)?;
        let api_key = cfg
            .api_key()
            .unwrap_or_else(|| SecretString::from(String::new()));
        Ok(Self::new(http, api_key, cfg.provider.base_url.clone(), store)
            .with_default_user(cfg.provider.default_user.clone())
            .with_default_transport(cfg.stream.transport))
    }

    pub fn with_default_user(mut self, user: impl Into<String>) -> Self {
        self.default_user = user.into();
        self
    }

    pub fn with_default_transport(mut self, transport: StreamTransport) -> Self {
        self.default_transport = transport;
        self
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str, store: Arc<dyn ConversationStore>) -> Self {
        Dify::new(
            HttpClient::new_default().unwrap(),
            SecretString::from("test-key".to_string()),
            server_base.to_string(),
            store,
        )
    }

    fn path(&self, p: &str) -> String {
        let url = format!("{}/{}", self.base.trim_end_matches('/'), p);
        debug!(%url, "resolved endpoint");
        url
    }

    // Content-Type comes from reqwest's `.json()`.
    fn headers(&self) -> Vec<(String, String)> {
        vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.api_key.expose_secret()),
        )]
    }

    /// Single blocking request outside the callback flow. Does not touch the
    /// conversation store.
    pub async fn send_message(&self, mut request: ChatTurnRequest) -> CoreResult<BlockingResponse> {
        if request.query.trim().is_empty() {
            return Err(ChatError::Validation("query cannot be empty".into()));
        }
        request.response_mode = ResponseMode::Blocking;
        if request.user.is_empty() {
            request.user = self.default_user.clone();
        }
        let owned_headers = self.headers();
        let hdrs = header_pairs(&owned_headers);
        let (reply, _, _) = self
            .http
            .post_json::<_, BlockingResponse>(
                &self.path(CHAT_PATH),
                &request,
                &hdrs,
                &CancellationToken::new(),
            )
            .await?;
        Ok(reply)
    }

    /// Validate the turn and build its request body. Applies the
    /// "first message starts fresh" rule to the store.
    pub(crate) fn prepare(
        &self,
        session_id: &str,
        messages: &[ChatMessage],
        config: &ChatConfig,
    ) -> CoreResult<ChatTurnRequest> {
        let query = messages
            .last()
            .map(ChatMessage::text_content)
            .unwrap_or_default();
        if query.trim().is_empty() {
            return Err(ChatError::Validation("query cannot be empty".into()));
        }

        let fresh = messages.len() == 1 && messages[0].role == Role::User;
        let conversation_id = match config.conversation_id.as_deref() {
            Some(id) if !id.is_empty() => Some(id.to_string()),
            _ if fresh => {
                if let Err(e) = self.store.set(session_id, None) {
                    warn!(error = %e, session.id = %session_id, "failed to clear conversation binding");
                }
                None
            }
            _ => self.store.get(session_id),
        };

        let user = match config.user_id.as_deref() {
            Some(u) if !u.is_empty() => u.to_string(),
            _ => self.default_user.clone(),
        };

        Ok(ChatTurnRequest {
            query: query.to_string(),
            user,
            conversation_id,
            response_mode: if config.stream {
                ResponseMode::Streaming
            } else {
                ResponseMode::Blocking
            },
            inputs: config.inputs.clone(),
        })
    }

    /// Run one turn and drive the callbacks. Returns `Err` only when the
    /// caller did not install `on_error`.
    pub async fn chat_turn(&self, options: ChatOptions) -> CoreResult<()> {
        let ChatOptions {
            session_id,
            messages,
            config,
            mut on_update,
            on_finish,
            on_error,
            on_controller,
        } = options;

        let request = match self.prepare(&session_id, &messages, &config) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, session.id = %session_id, "turn rejected");
                return deliver(e, on_error);
            }
        };
        let transport = config
            .stream
            .then(|| config.transport.unwrap_or(self.default_transport));
        let label = transport.map_or("blocking", StreamTransport::as_str);

        let cancel = CancellationToken::new();
        if let Some(f) = on_controller {
            f(cancel.clone());
        }

        let span = info_span!(
            "vizier.chat_turn",
            llm.provider = %self.name,
            session.id = %session_id,
            transport = label,
            conversation.id = field::Empty,
            llm.req_id = field::Empty,
            records = field::Empty,
            latency.ms = field::Empty,
            text.len = field::Empty,
            error.kind = field::Empty,
        );

        let mut state = TurnState::new(
            &session_id,
            self.store.clone(),
            request.conversation_id.clone(),
        );
        let outcome = async {
            match transport {
                Some(t) => {
                    self.stream_turn(&request, t, &cancel, &mut state, &mut on_update)
                        .await
                }
                None => self.blocking_turn(&request, &cancel, &mut state).await,
            }
        }
        .instrument(span.clone())
        .await;
        let outcome = match outcome {
            Ok(_) if cancel.is_cancelled() => Err(ChatError::Cancelled),
            other => other,
        };

        if let Some(id) = state.conversation_id.as_deref() {
            span.record("conversation.id", id);
        }
        span.record("records", state.records);
        span.record("text.len", state.text.len() as u64);
        let log = TurnLog::new()
            .provider(&self.name)
            .session_id(&session_id)
            .transport(label)
            .conversation_id_opt(state.conversation_id.as_deref())
            .records(state.records)
            .text_len(state.text.len());

        match outcome {
            Ok(response) => {
                if let Some(id) = response.provider_request_id.as_deref() {
                    span.record("llm.req_id", id);
                }
                span.record("latency.ms", response.latency_ms as u64);
                let usage = response.usage();
                emit_turn(
                    log.message_id_opt(response.message_id.as_deref())
                        .provider_request_id_opt(response.provider_request_id.as_deref())
                        .latency_ms(response.latency_ms as u64)
                        .tokens(
                            usage.as_ref().map(|u| u.prompt_tokens),
                            usage.as_ref().map(|u| u.completion_tokens),
                            usage.as_ref().map(|u| u.total_tokens),
                        ),
                );
                span.in_scope(|| debug!(text_len = state.text.len(), "turn finished"));
                if let Some(f) = on_finish {
                    f(state.text, response);
                }
                Ok(())
            }
            Err(err) => {
                span.record("error.kind", err.kind());
                span.in_scope(|| match &err {
                    ChatError::Cancelled => debug!("turn cancelled"),
                    e => warn!(error = %e, "turn failed"),
                });
                emit_turn(log.error(err.kind(), &err.to_string()));
                deliver(err, on_error)
            }
        }
    }

    async fn stream_turn(
        &self,
        request: &ChatTurnRequest,
        transport: StreamTransport,
        cancel: &CancellationToken,
        state: &mut TurnState,
        on_update: &mut Option<UpdateCallback>,
    ) -> CoreResult<TurnResponse> {
        let owned_headers = self.headers();
        let hdrs = header_pairs(&owned_headers);
        let accept = match transport {
            StreamTransport::EventStream => "text/event-stream",
            StreamTransport::Chunked => "*/*",
        };
        let reply = self
            .http
            .post_stream(&self.path(CHAT_PATH), request, &hdrs, accept, cancel)
            .await?;

        let records = decoder::decode(transport, reply.body);
        let mut response = drive_records(records, transport, cancel, state, on_update).await?;
        response.provider_request_id = reply.provider_request_id;
        response.latency_ms = reply.started.elapsed().as_millis() as u32;
        Ok(response)
    }

    async fn blocking_turn(
        &self,
        request: &ChatTurnRequest,
        cancel: &CancellationToken,
        state: &mut TurnState,
    ) -> CoreResult<TurnResponse> {
        let owned_headers = self.headers();
        let hdrs = header_pairs(&owned_headers);
        let (mut reply, provider_request_id, latency_ms) = self
            .http
            .post_json::<_, BlockingResponse>(&self.path(CHAT_PATH), request, &hdrs, cancel)
            .await?;

        state.observe_conversation(reply.conversation_id.as_deref());
        state.text = std::mem::take(&mut reply.answer);

        let mut response = TurnResponse::from(reply);
        if response.conversation_id.is_none() {
            response.conversation_id = state.conversation_id.clone();
        }
        response.provider_request_id = provider_request_id;
        response.latency_ms = latency_ms;
        Ok(response)
    }
}

impl std::fmt::Debug for Dify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dify")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("default_user", &self.default_user)
            .field("default_transport", &self.default_transport)
            .finish_non_exhaustive()
    }
}

fn header_pairs(owned: &[(String, String)]) -> Vec<(&str, &str)> {
    owned
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

fn deliver(err: ChatError, on_error: Option<ErrorCallback>) -> CoreResult<()> {
    match on_error {
        Some(f) => {
            f(err);
            Ok(())
        }
        None => Err(err),
    }
}

/// Mutable state of one turn, shared by both transports.
pub(crate) struct TurnState {
    session_id: String,
    store: Arc<dyn ConversationStore>,
    /// Latest conversation id for this turn: the one sent, or the last one received.
    pub(crate) conversation_id: Option<String>,
    pub(crate) text: String,
    pub(crate) records: u64,
}

impl TurnState {
    pub(crate) fn new(
        session_id: &str,
        store: Arc<dyn ConversationStore>,
        conversation_id: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            store,
            conversation_id,
            text: String::new(),
            records: 0,
        }
    }

    /// Write a provider-issued conversation id through to the store if it
    /// differs from the current binding. A failed write is logged, not fatal.
    pub(crate) fn observe_conversation(&mut self, id: Option<&str>) {
        let Some(id) = id.filter(|s| !s.is_empty()) else {
            return;
        };
        if self.conversation_id.as_deref() != Some(id) {
            self.conversation_id = Some(id.to_string());
        }
        if self.store.get(&self.session_id).as_deref() == Some(id) {
            return;
        }
        debug!(conversation.id = %id, session.id = %self.session_id, "binding session");
        if let Err(e) = self.store.set(&self.session_id, Some(id)) {
            warn!(error = %e, session.id = %self.session_id, "failed to persist conversation binding");
        }
    }
}

/// Consume decoded records until the turn ends, accumulating text into
/// `state` and reporting each fragment through `on_update`.
///
/// Ends cleanly on `message_end` or when the body closes; an SSE body that
/// closes before any record arrived is a protocol error. The token is checked
/// before every read and before every callback.
pub(crate) async fn drive_records(
    mut records: RecordStream,
    transport: StreamTransport,
    cancel: &CancellationToken,
    state: &mut TurnState,
    on_update: &mut Option<UpdateCallback>,
) -> CoreResult<TurnResponse> {
    let mut response = TurnResponse::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            next = records.next() => next,
        };
        let record = match next {
            Some(r) => r?,
            None if state.records == 0 && transport.requires_event_before_close() => {
                return Err(ChatError::Protocol(
                    "stream closed before any event was received".into(),
                ));
            }
            None => {
                debug!(records = state.records, "stream closed without message_end");
                break;
            }
        };
        state.records += 1;
        state.observe_conversation(record.conversation_id());

        match record {
            StreamRecord::Message {
                answer, message_id, ..
            } => {
                if message_id.is_some() {
                    response.message_id = message_id;
                }
                if answer.is_empty() {
                    continue;
                }
                state.text.push_str(&answer);
                if cancel.is_cancelled() {
                    return Err(ChatError::Cancelled);
                }
                if let Some(f) = on_update.as_mut() {
                    f(&state.text, &answer);
                }
            }
            StreamRecord::MessageEnd {
                message_id,
                created_at,
                metadata,
                ..
            } => {
                if message_id.is_some() {
                    response.message_id = message_id;
                }
                response.created_at = created_at;
                response.metadata = metadata;
                break;
            }
            StreamRecord::Error {
                message,
                code,
                status,
            } => {
                return Err(ChatError::ProviderReported {
                    message,
                    code,
                    status,
                });
            }
            StreamRecord::Done => debug!("terminator received"),
            StreamRecord::Other { event, .. } => debug!(?event, "ignoring record"),
        }
    }
    response.conversation_id = state.conversation_id.clone();
    Ok(response)
}

#[async_trait]
impl LlmApi for Dify {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, options: ChatOptions) -> CoreResult<()> {
        self.chat_turn(options).await
    }
}

impl ProviderCaps for Dify {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Chat, Capability::ChatStream]
    }
}
