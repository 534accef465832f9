//! Addressable LLM endpoints over the OpenAI-chat wire.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::ai::types::{AiError, ChatMessage, ChatResponse};

/// Priority class of a client. Selection prefers free capacity over paid:
/// freebie > normal > expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientPriority {
    Expensive,
    Normal,
    Freebie,
}

impl ClientPriority {
    /// Higher rank is preferred.
    pub fn rank(&self) -> u8 {
        match self {
            ClientPriority::Expensive => 0,
            ClientPriority::Normal => 1,
            ClientPriority::Freebie => 2,
        }
    }
}

/// Shared bookkeeping every client variant carries: identity, availability,
/// in-flight and quota counters, and the balance estimate.
pub struct ClientCore {
    name: String,
    group_id: String,
    priority: ClientPriority,
    available: AtomicBool,
    in_flight: AtomicUsize,
    requests_total: AtomicU64,
    balance: Mutex<f64>,
    /// Balance below this marks the client unavailable during monitoring
    hard_threshold: f64,
}

impl ClientCore {
    pub fn new(
        name: &str,
        group_id: &str,
        priority: ClientPriority,
        default_available: bool,
        hard_threshold: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            group_id: group_id.to_string(),
            priority,
            available: AtomicBool::new(default_available),
            in_flight: AtomicUsize::new(0),
            requests_total: AtomicU64::new(0),
            balance: Mutex::new(0.0),
            hard_threshold,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn priority(&self) -> ClientPriority {
        self.priority
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn enter_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn leave_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::SeqCst)
    }

    pub fn count_request(&self) -> u64 {
        self.requests_total.fetch_add(1, Ordering::SeqCst)
    }

    pub fn balance(&self) -> f64 {
        *self.balance.lock()
    }

    pub fn update_balance(&self, value: f64) {
        *self.balance.lock() = value;
    }

    pub fn hard_threshold(&self) -> f64 {
        self.hard_threshold
    }
}

/// One addressable LLM endpoint.
#[async_trait]
pub trait AiClient: Send + Sync {
    fn core(&self) -> &ClientCore;

    fn current_model(&self) -> String;

    fn current_base_url(&self) -> String;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<ChatResponse, AiError>;

    /// Probes the provider's balance endpoint. `None` when the endpoint
    /// cannot be probed; such clients keep their configured availability.
    async fn probe_balance(&self) -> Option<f64> {
        None
    }

    /// Hook for an outer rotator to install a fresh credential.
    fn install_token(&self, _token: SecretString) {}

    fn name(&self) -> &str {
        self.core().name()
    }

    fn group_id(&self) -> &str {
        self.core().group_id()
    }

    fn priority(&self) -> ClientPriority {
        self.core().priority()
    }

    fn is_available(&self) -> bool {
        self.core().is_available()
    }

    fn in_flight(&self) -> usize {
        self.core().in_flight()
    }

    fn update_balance(&self, value: f64) {
        self.core().update_balance(value);
    }
}

/// Shared HTTP plumbing for OpenAI-compatible endpoints.
pub(crate) struct OpenAiHttp {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

impl OpenAiHttp {
    pub fn new(base_url: &str, timeout: Duration, proxy: Option<&str>) -> Self {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy_url) = proxy {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => tracing::warn!(proxy = proxy_url, error = %e, "Ignoring invalid proxy"),
            }
        }
        Self {
            http: builder.build().unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn chat_completion(
        &self,
        token: &SecretString,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<ChatResponse, AiError> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::transient(format!("Request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AiError::transient(format!("Body read failed: {}", e)))?;

        if !status.is_success() {
            return Err(AiError::from_status(status.as_u16(), &text));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| AiError::transient(format!("Unparseable chat response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AiError::transient("Chat response carried no choices"))?;

        Ok(ChatResponse {
            content,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
        })
    }

    /// SiliconFlow-style balance probe: `GET /v1/user/info`, reading
    /// `data.totalBalance` as a number or numeric string.
    pub async fn user_balance(&self, token: &SecretString) -> Option<f64> {
        let response = self
            .http
            .get(format!("{}/v1/user/info", self.base_url))
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: serde_json::Value = response.json().await.ok()?;
        let balance = &body["data"]["totalBalance"];
        balance
            .as_f64()
            .or_else(|| balance.as_str().and_then(|s| s.parse().ok()))
    }
}

/// Fixed model + fixed token endpoint.
pub struct StandardClient {
    core: ClientCore,
    http: OpenAiHttp,
    model: String,
    token: RwLock<SecretString>,
}

impl StandardClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        base_url: &str,
        token: SecretString,
        model: &str,
        group_id: &str,
        priority: ClientPriority,
        timeout: Duration,
        proxy: Option<&str>,
        hard_threshold: f64,
    ) -> Self {
        Self {
            core: ClientCore::new(name, group_id, priority, true, hard_threshold),
            http: OpenAiHttp::new(base_url, timeout, proxy),
            model: model.to_string(),
            token: RwLock::new(token),
        }
    }
}

#[async_trait]
impl AiClient for StandardClient {
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
            if error.kind == crate::ai::types::AiErrorKind::Auth {
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
    }
}
