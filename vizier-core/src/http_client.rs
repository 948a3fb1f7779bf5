use std::future::Future;
use std::time::{Duration, Instant};

use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::HttpCfg;
use crate::error::{ChatError, CoreResult};
use crate::stream::ByteStream;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

/// Successful streaming reply: the body plus what was known from the headers.
pub struct StreamReply {
    pub body: ByteStream,
    pub provider_request_id: Option<String>,
    pub started: Instant,
}

impl HttpClient {
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(ms) = cfg.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| ChatError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("vizier/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    /// POST JSON and decode a single JSON reply. Returns the body, the provider
    /// request id (if any header carried one), and the latency in ms.
    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> CoreResult<(R, Option<String>, u32)> {
        let start = Instant::now();
        let resp = self
            .send(url, body, headers, "application/json", cancel)
            .await?;
        let provider_request_id = extract_request_id(resp.headers());
        let status = resp.status();

        let bytes = until_cancelled(cancel, async move {
            resp.bytes()
                .await
                .map_err(|e| ChatError::transport(format!("failed to read response body: {e}")))
        })
        .await?;
        let parsed = serde_json::from_slice::<R>(&bytes).map_err(|e| {
            ChatError::Protocol(format!("json decode error ({}): {e}", status.as_u16()))
        })?;
        let latency = start.elapsed().as_millis() as u32;
        Ok((parsed, provider_request_id, latency))
    }

    /// POST JSON and hand back the response body as a byte stream.
    /// Status is checked first; the body is not read here.
    pub async fn post_stream<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        accept: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<StreamReply> {
        let started = Instant::now();
        let resp = self.send(url, body, headers, accept, cancel).await?;
        let provider_request_id = extract_request_id(resp.headers());
        let body = resp
            .bytes_stream()
            .map_err(|e| ChatError::transport(format!("stream read failed: {e}")))
            .boxed();
        Ok(StreamReply {
            body,
            provider_request_id,
            started,
        })
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        accept: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<Response> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", accept);

        // custom headers
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = until_cancelled(cancel, async move {
            req.send()
                .await
                .map_err(|e| ChatError::transport(format!("request to {url} failed: {e}")))
        })
        .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = until_cancelled(cancel, async move { Ok(resp.text().await.unwrap_or_default()) })
                .await?;
            return Err(map_http_error(status, &text));
        }
        Ok(resp)
    }
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = CoreResult<T>>,
) -> CoreResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ChatError::Cancelled),
        out = fut => out,
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 3] = ["x-request-id", "request-id", "x-trace-id"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

fn map_http_error(status: StatusCode, body: &str) -> ChatError {
    let (message, code) = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { message, code }) => (
            message.unwrap_or_else(|| "Unknown API error".to_string()),
            code,
        ),
        Err(_) if body.trim().is_empty() => ("Unknown API error".to_string(), None),
        Err(_) => (truncate(body, 300), None),
    };
    ChatError::Transport {
        status: Some(status.as_u16()),
        code,
        message,
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => {
            let mut t = s[..idx].to_string();
            t.push_str("...");
            t
        }
        None => s.to_string(),
    }
}
