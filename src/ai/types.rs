//! Chat DTOs and the provider error classification the retry logic keys on.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
}

/// Retryability verdict for a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiErrorKind {
    /// Network trouble, rate limiting, upstream 5xx, or a garbled body.
    /// Retried per policy.
    Transient,
    /// HTTP 400: malformed or policy-refused content. Never retried.
    Sensitive,
    /// HTTP 401/403: the credential is dead. The client goes unavailable
    /// until a rotator restores it.
    Auth,
    /// Any other terminal failure.
    Terminal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AiError {
    pub kind: AiErrorKind,
    /// HTTP status of the failing call. Populated for every HTTP failure.
    pub api_error_code: Option<u16>,
    pub message: String,
}

impl AiError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: AiErrorKind::Transient,
            api_error_code: None,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: AiErrorKind::Terminal,
            api_error_code: None,
            message: message.into(),
        }
    }

    /// Classifies an HTTP failure status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            400 => AiErrorKind::Sensitive,
            401 | 403 => AiErrorKind::Auth,
            429 => AiErrorKind::Transient,
            500..=599 => AiErrorKind::Transient,
            _ => AiErrorKind::Terminal,
        };
        Self {
            kind,
            api_error_code: Some(status),
            message: format!("HTTP {}: {}", status, truncate(body, 300)),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == AiErrorKind::Transient
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
