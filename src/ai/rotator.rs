//! Background credential rotation from a key pool.
//!
//! Periodically probes the keys in a pool file (one per line) against the
//! provider's balance endpoint and installs the first key whose balance
//! clears the threshold onto the managed client, restoring its
//! availability. With no live key the client is parked unavailable.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use crate::ai::client::{AiClient, OpenAiHttp};

pub struct TokenRotator {
    client: Arc<dyn AiClient>,
    keys_file: PathBuf,
    threshold: f64,
    interval: Duration,
    probe: OpenAiHttp,
}

impl TokenRotator {
    pub fn new(
        client: Arc<dyn AiClient>,
        keys_file: PathBuf,
        threshold: f64,
        interval: Duration,
    ) -> Self {
        let probe = OpenAiHttp::new(&client.current_base_url(), Duration::from_secs(10), None);
        Self {
            client,
            keys_file,
            threshold,
            interval,
            probe,
        }
    }

    /// Spawns the rotation loop.
    pub fn start(
        self,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                client = self.client.name(),
                keys_file = %self.keys_file.display(),
                threshold = self.threshold,
                "Token rotator started"
            );
            loop {
                self.rotate_once().await;
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!(client = self.client.name(), "Token rotator shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        })
    }

    async fn rotate_once(&self) {
        let keys = match self.read_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(
                    client = self.client.name(),
                    keys_file = %self.keys_file.display(),
                    error = %e,
                    "Cannot read key pool"
                );
                return;
            }
        };

        for key in keys {
            let token = SecretString::from(key);
            let Some(balance) = self.probe.user_balance(&token).await else {
                continue;
            };
            if balance >= self.threshold {
                self.client.install_token(token);
                self.client.update_balance(balance);
                tracing::info!(
                    client = self.client.name(),
                    balance,
                    "Installed fresh key from pool"
                );
                return;
            }
        }

        tracing::warn!(
            client = self.client.name(),
            "No key in the pool clears the balance threshold"
        );
        self.client.core().set_available(false);
    }

    async fn read_keys(&self) -> std::io::Result<Vec<String>> {
        let content = tokio::fs::read_to_string(&self.keys_file).await?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::{ClientCore, ClientPriority};
    use crate::ai::types::{AiError, ChatMessage, ChatResponse};
    use async_trait::async_trait;

    struct NullClient {
        core: ClientCore,
    }

    #[async_trait]
    impl AiClient for NullClient {
        fn core(&self) -> &ClientCore {
            &self.core
        }

        fn current_model(&self) -> String {
            "m".to_string()
        }

        fn current_base_url(&self) -> String {
            "http://localhost:1".to_string()
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<ChatResponse, AiError> {
            Err(AiError::terminal("null client"))
        }
    }

    #[tokio::test]
    async fn test_read_keys_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let keys_path = dir.path().join("keys.txt");
        tokio::fs::write(&keys_path, "# pool\nsk-one\n\n  sk-two  \n")
            .await
            .unwrap();

        let rotator = TokenRotator::new(
            Arc::new(NullClient {
                core: ClientCore::new("c", "g", ClientPriority::Normal, false, 0.1),
            }),
            keys_path,
            0.1,
            Duration::from_secs(60),
        );
        let keys = rotator.read_keys().await.unwrap();
        assert_eq!(keys, vec!["sk-one".to_string(), "sk-two".to_string()]);
    }
}
