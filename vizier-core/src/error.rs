use thiserror::Error;

/// Core error type for vizier.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Rejected before anything reached the network.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Network failure or non-2xx reply.
    #[error("transport error{}: {message}", fmt_status(*status))]
    Transport {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    /// The response could not be decoded far enough to make progress.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Explicit error event or field sent by the provider, message verbatim.
    #[error("{message}")]
    ProviderReported {
        message: String,
        code: Option<String>,
        status: Option<u16>,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("{0} is not supported by this provider")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn fmt_status(status: Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl ChatError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    /// HTTP status attached to the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } | Self::ProviderReported { status, .. } => *status,
            _ => None,
        }
    }

    /// Provider-specific error code, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Transport { code, .. } | Self::ProviderReported { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Short stable name for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transport { .. } => "transport",
            Self::Protocol(_) => "protocol",
            Self::ProviderReported { .. } => "provider",
            Self::Cancelled => "cancelled",
            Self::Unsupported(_) => "unsupported",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_display_includes_status() {
        let err = ChatError::Transport {
            status: Some(400),
            code: Some("invalid_param".into()),
            message: "bad".into(),
        };
        assert_eq!(err.to_string(), "transport error (400): bad");
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.code(), Some("invalid_param"));
        assert_eq!(err.kind(), "transport");

        let err = ChatError::transport("connection refused");
        assert_eq!(err.to_string(), "transport error: connection refused");
        assert_eq!(err.status(), None);
    }

    #[test]
    fn provider_message_is_verbatim() {
        let err = ChatError::ProviderReported {
            message: "Model quota exceeded".into(),
            code: None,
            status: None,
        };
        assert_eq!(err.to_string(), "Model quota exceeded");
        assert_eq!(ChatError::Validation("query cannot be empty".into()).code(), None);
    }
}
