//! Shared fixtures: a hub wired to a scripted AI client and an on-disk
//! vector engine with the deterministic hash embedder, plus an HTTP test
//! app running on a random port.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use intelhub::ai::client::{AiClient, ClientCore, ClientPriority};
use intelhub::ai::manager::AiClientManager;
use intelhub::ai::types::{AiError, ChatMessage, ChatResponse};
use intelhub::config::FulltextSource;
use intelhub::conversation::ConversationRecorder;
use intelhub::hub::{HubOptions, IntelligenceHub};
use intelhub::middleware::AccessManager;
use intelhub::state::AppState;
use intelhub::vector::VectorEngine;
use intelhub::vector::embedder::HashEmbedder;

/// An AI client answering from a pre-loaded script. Each `chat` call pops
/// the next step; call instants are recorded for backoff assertions.
pub struct ScriptedClient {
    core: ClientCore,
    script: Mutex<VecDeque<Result<String, AiError>>>,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedClient {
    pub fn new(script: Vec<Result<String, AiError>>) -> Arc<Self> {
        Arc::new(Self {
            core: ClientCore::new("scripted", "test", ClientPriority::Normal, true, 0.0),
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Gaps between consecutive calls, for retry backoff assertions.
    pub fn call_gaps(&self) -> Vec<Duration> {
        let calls = self.calls.lock();
        calls.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }
}

#[async_trait]
impl AiClient for ScriptedClient {
    fn core(&self) -> &ClientCore {
        &self.core
    }

    fn current_model(&self) -> String {
        "scripted-model".to_string()
    }

    fn current_base_url(&self) -> String {
        "http://scripted.test".to_string()
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<ChatResponse, AiError> {
        self.calls.lock().push(Instant::now());
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(AiError::terminal("script exhausted")));
        step.map(|content| ChatResponse {
            content,
            model: "scripted-model".to_string(),
        })
    }
}

/// A fully assembled in-memory hub: no document stores, scripted AI,
/// hash-embedder vector engine over a temp directory.
pub struct TestHub {
    pub hub: Arc<IntelligenceHub>,
    pub engine: Arc<VectorEngine>,
    pub client: Arc<ScriptedClient>,
    pub shutdown_tx: broadcast::Sender<()>,
    _vector_dir: tempfile::TempDir,
    _conversation_dir: tempfile::TempDir,
}

impl TestHub {
    pub async fn start(script: Vec<Result<String, AiError>>) -> Self {
        let hub = Self::build(script).await;
        hub.hub.startup().await;
        // Let the vector pipeline come up before tests submit work
        assert!(
            hub.engine.wait_until_ready(Duration::from_secs(10)).await,
            "vector engine must reach ready"
        );
        hub
    }

    /// Builds the hub without starting workers, for tests that inspect
    /// queue behavior directly.
    pub async fn build(script: Vec<Result<String, AiError>>) -> Self {
        let vector_dir = tempfile::tempdir().expect("tempdir");
        let conversation_dir = tempfile::tempdir().expect("tempdir");

        let engine = VectorEngine::start_with_embedder(
            vector_dir.path(),
            Arc::new(HashEmbedder::default()),
        );

        let client = ScriptedClient::new(script);
        let clients = AiClientManager::new();
        clients.register_client(client.clone());

        let recorder =
            Arc::new(ConversationRecorder::open(conversation_dir.path()).expect("recorder"));

        let (shutdown_tx, _) = broadcast::channel(8);
        let hub = IntelligenceHub::new(
            None,
            None,
            None,
            Some(engine.clone()),
            clients,
            recorder,
            shutdown_tx.clone(),
            HubOptions {
                analysis_workers: 1,
                fulltext_source: FulltextSource::Raw,
                export_directory: vector_dir.path().join("export"),
            },
        );

        Self {
            hub,
            engine,
            client,
            shutdown_tx,
            _vector_dir: vector_dir,
            _conversation_dir: conversation_dir,
        }
    }

    /// Polls until the given counter predicate holds or the timeout hits.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&intelhub::hub::stats::HubCounters) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.hub.statistics().counters) {
                return true;
            }
            if Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn stop(&self) {
        self.hub.shutdown(Duration::from_secs(5)).await;
    }
}

/// A hub API server on a random port.
pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub hub: TestHub,
}

impl TestApp {
    pub async fn spawn(script: Vec<Result<String, AiError>>) -> Self {
        let hub = TestHub::start(script).await;
        Self::spawn_with(hub).await
    }

    /// Serves a hub whose workers were never started, so submitted items
    /// stay queued for inspection.
    pub async fn spawn_idle() -> Self {
        let hub = TestHub::build(vec![]).await;
        Self::spawn_with(hub).await
    }

    async fn spawn_with(hub: TestHub) -> Self {
        let access = Arc::new(AccessManager::with_tokens(
            vec!["rpc-token".to_string()],
            vec!["collector-token".to_string()],
            vec!["processor-token".to_string()],
        ));
        let state = AppState::new(hub.hub.clone(), access, Some(hub.engine.clone()));

        let app = axum::Router::new()
            .merge(intelhub::create_api_router())
            .merge(intelhub::create_vector_router())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind random port");
        let port = listener.local_addr().expect("local addr").port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("http client");

        Self {
            address: format!("http://127.0.0.1:{}", port),
            client,
            hub,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }
}

/// A well-formed analysis reply for the scripted client.
pub fn valid_analysis_reply(uuid: &str) -> String {
    serde_json::json!({
        "UUID": uuid,
        "EVENT_TITLE": "Port expansion announced",
        "EVENT_BRIEF": "A major port expansion project was announced with state funding.",
        "EVENT_TEXT": "The regional authority confirmed a multi-year port expansion. \
                       Construction begins next quarter and doubles container capacity.",
        "EVENT_LOCATIONS": ["Rotterdam"],
        "EVENT_PEOPLES": [],
        "EVENT_ORGANIZATIONS": ["Port Authority"],
        "RATE": { "MILITARY": 1, "POLITICS": 4, "ECONOMY": 8, "TECHNOLOGY": 3, "SOCIETY": 2, "CONFIDENCE": 9 },
    })
    .to_string()
}

/// A collected item as a feeder would submit it.
pub fn collected_item(uuid: &str, informant: &str) -> serde_json::Value {
    serde_json::json!({
        "UUID": uuid,
        "informant": informant,
        "title": "Collected article",
        "content": "Raw scraped article body describing a port expansion announcement \
                    with enough text to be worth analyzing.",
    })
}
