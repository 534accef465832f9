//! Rotating client variants.
//!
//! `SelfRotatingClient` cycles through its own model and token lists on a
//! request counter. `OuterTokenRotatingClient` leaves credential refresh to
//! an external [`crate::ai::rotator::TokenRotator`]; its surface is
//! otherwise identical to the standard client.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use secrecy::SecretString;

use crate::ai::client::{AiClient, ClientCore, ClientPriority, OpenAiHttp};
use crate::ai::types::{AiError, AiErrorKind, ChatMessage, ChatResponse};

/// Cycles models every `rotate_models_per` requests and tokens every
/// `rotate_tokens_per` requests.
pub struct SelfRotatingClient {
    core: ClientCore,
    http: OpenAiHttp,
    models: Vec<String>,
    tokens: Vec<SecretString>,
    rotate_models_per: u64,
    rotate_tokens_per: u64,
}

impl SelfRotatingClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        base_url: &str,
        models: Vec<String>,
        tokens: Vec<SecretString>,
        rotate_models_per: u64,
        rotate_tokens_per: u64,
        group_id: &str,
        priority: ClientPriority,
        timeout: Duration,
        proxy: Option<&str>,
    ) -> Self {
        assert!(!models.is_empty(), "at least one model is required");
        assert!(!tokens.is_empty(), "at least one token is required");
        Self {
            core: ClientCore::new(name, group_id, priority, true, 0.0),
            http: OpenAiHttp::new(base_url, timeout, proxy),
            models,
            tokens,
            rotate_models_per: rotate_models_per.max(1),
            rotate_tokens_per: rotate_tokens_per.max(1),
        }
    }

    fn model_for(&self, request_index: u64) -> &str {
        let slot = (request_index / self.rotate_models_per) as usize % self.models.len();
        &self.models[slot]
    }

    fn token_for(&self, request_index: u64) -> &SecretString {
        let slot = (request_index / self.rotate_tokens_per) as usize % self.tokens.len();
        &self.tokens[slot]
    }
}

#[async_trait]
impl AiClient for SelfRotatingClient {
    fn core(&self) -> &ClientCore {
        &self.core
    }

    fn current_model(&self) -> String {
        self.model_for(self.core.requests_total()).to_string()
    }

    fn current_base_url(&self) -> String {
        self.http.base_url().to_string()
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<ChatResponse, AiError> {
        let request_index = self.core.count_request();
        let model = self.model_for(request_index).to_string();
        let token = self.token_for(request_index).clone();
        let result = self
            .http
            .chat_completion(&token, &model, messages, temperature, max_tokens)
            .await;
        if let Err(error) = &result {
            if error.kind == AiErrorKind::Auth {
                self.core.set_available(false);
            }
        }
        result
    }
}

/// Token injected from outside; becomes available again whenever the
/// rotator installs a live key.
pub struct OuterTokenRotatingClient {
    core: ClientCore,
    http: OpenAiHttp,
    model: String,
    token: RwLock<SecretString>,
}

impl OuterTokenRotatingClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        base_url: &str,
        model: &str,
        group_id: &str,
        priority: ClientPriority,
        timeout: Duration,
        proxy: Option<&str>,
        hard_threshold: f64,
    ) -> Self {
        Self {
            // Starts unavailable; the rotator flips it on once a key holds
            core: ClientCore::new(name, group_id, priority, false, hard_threshold),
            http: OpenAiHttp::new(base_url, timeout, proxy),
            model: model.to_string(),
            token: RwLock::new(SecretString::from(String::new())),
        }
    }
}

#[async_trait]
impl AiClient for OuterTokenRotatingClient {
    fn core(&self) -> &ClientCore {
        &self.core
    }

    fn current_model(&self) -> String {
        self.model.clone()
    }

    fn current_base_url(&self) -> String {
        self.http.base_url().to_string()
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<ChatResponse, AiError> {
        self.core.count_request();
        let token = self.token.read().clone();
        let result = self
            .http
            .chat_completion(&token, &self.model, messages, temperature, max_tokens)
            .await;
        if let Err(error) = &result {
            if error.kind == AiErrorKind::Auth {
                // Dead key; stay out of the pool until the rotator refreshes
                self.core.set_available(false);
            }
        }
        result
    }

    async fn probe_balance(&self) -> Option<f64> {
        let token = self.token.read().clone();
        self.http.user_balance(&token).await
    }

    fn install_token(&self, token: SecretString) {
        *self.token.write() = token;
        self.core.set_available(true);
    }
}
