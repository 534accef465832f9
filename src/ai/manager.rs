//! Client pool with lease-based acquisition.
//!
//! Selection respects per-client availability and per-group concurrency
//! limits, prefers higher priority classes (freebie > normal > expensive),
//! and within a class the smallest in-flight count, then the
//! least-recently-used client, then the name. Leases release on drop so no
//! exit path can leak one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::ai::client::{AiClient, ClientPriority};

struct ClientEntry {
    client: Arc<dyn AiClient>,
    last_used: Instant,
}

#[derive(Default)]
struct ManagerInner {
    clients: Vec<ClientEntry>,
    group_limits: HashMap<String, usize>,
    group_in_flight: HashMap<String, usize>,
}

#[derive(Default)]
pub struct AiClientManager {
    inner: Mutex<ManagerInner>,
}

/// Point-in-time view of one client, for the statistics surface.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub name: String,
    pub group: String,
    pub priority: ClientPriority,
    pub available: bool,
    pub in_flight: usize,
    pub balance: f64,
    pub model: String,
    pub requests_total: u64,
}

impl AiClientManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_client(&self, client: Arc<dyn AiClient>) {
        tracing::info!(client = client.name(), group = client.group_id(), "Register AI client");
        self.inner.lock().clients.push(ClientEntry {
            client,
            last_used: Instant::now(),
        });
    }

    /// Caps the number of simultaneous leases inside one group.
    pub fn set_group_limit(&self, group: &str, limit: usize) {
        self.inner.lock().group_limits.insert(group.to_string(), limit);
    }

    /// Leases the best available client, or `None` when every candidate is
    /// unavailable or its group is saturated. Callers retry after a
    /// jittered delay.
    pub fn get_available_client(self: &Arc<Self>, lease_owner: &str) -> Option<ClientLease> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let mut best: Option<usize> = None;
        for (index, entry) in inner.clients.iter().enumerate() {
            let client = &entry.client;
            if !client.is_available() {
                continue;
            }
            let group = client.group_id();
            let limit = inner.group_limits.get(group).copied().unwrap_or(usize::MAX);
            let group_busy = inner.group_in_flight.get(group).copied().unwrap_or(0);
            if group_busy >= limit {
                continue;
            }

            let better = match best {
                None => true,
                Some(best_index) => {
                    let current = &inner.clients[best_index];
                    let candidate_key = selection_key(entry);
                    let current_key = selection_key(current);
                    candidate_key < current_key
                }
            };
            if better {
                best = Some(index);
            }
        }

        let index = best?;
        let entry = &mut inner.clients[index];
        let client = entry.client.clone();
        entry.last_used = Instant::now();
        client.core().enter_flight();
        *inner
            .group_in_flight
            .entry(client.group_id().to_string())
            .or_insert(0) += 1;

        tracing::debug!(
            client = client.name(),
            owner = lease_owner,
            in_flight = client.in_flight(),
            "AI client leased"
        );

        Some(ClientLease {
            client,
            manager: self.clone(),
            owner: lease_owner.to_string(),
        })
    }

    fn release(&self, client: &Arc<dyn AiClient>, owner: &str) {
        let mut inner = self.inner.lock();
        client.core().leave_flight();
        if let Some(count) = inner.group_in_flight.get_mut(client.group_id()) {
            *count = count.saturating_sub(1);
        }
        tracing::debug!(client = client.name(), owner, "AI client released");
    }

    /// Current in-flight count of a group.
    pub fn group_in_flight(&self, group: &str) -> usize {
        self.inner.lock().group_in_flight.get(group).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<ClientStatus> {
        let inner = self.inner.lock();
        inner
            .clients
            .iter()
            .map(|entry| {
                let client = &entry.client;
                ClientStatus {
                    name: client.name().to_string(),
                    group: client.group_id().to_string(),
                    priority: client.priority(),
                    available: client.is_available(),
                    in_flight: client.in_flight(),
                    balance: client.core().balance(),
                    model: client.current_model(),
                    requests_total: client.core().requests_total(),
                }
            })
            .collect()
    }

    fn clients(&self) -> Vec<Arc<dyn AiClient>> {
        self.inner.lock().clients.iter().map(|e| e.client.clone()).collect()
    }

    /// Spawns the background balance poller. Clients whose probe answers
    /// are re-marked available/unavailable against their hard threshold;
    /// unprobeable clients keep their state.
    pub fn start_monitoring(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            tracing::info!(interval_s = interval.as_secs(), "AI client monitor started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("AI client monitor shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        for client in manager.clients() {
                            let Some(balance) = client.probe_balance().await else {
                                continue;
                            };
                            client.update_balance(balance);
                            let healthy = balance >= client.core().hard_threshold();
                            if client.is_available() != healthy {
                                tracing::info!(
                                    client = client.name(),
                                    balance,
                                    healthy,
                                    "Client availability changed by balance probe"
                                );
                            }
                            client.core().set_available(healthy);
                        }
                    }
                }
            }
        })
    }
}

/// Ordering key: lower sorts first. Priority rank is negated so the
/// highest class wins, then fewest in-flight, then least recently used,
/// then name.
fn selection_key(entry: &ClientEntry) -> (i16, usize, Instant, String) {
    (
        -i16::from(entry.client.priority().rank()),
        entry.client.in_flight(),
        entry.last_used,
        entry.client.name().to_string(),
    )
}

/// A held lease. Dropping it releases the client and its group slot, so
/// panics and early returns cannot leak capacity.
pub struct ClientLease {
    client: Arc<dyn AiClient>,
    manager: Arc<AiClientManager>,
    owner: String,
}

impl ClientLease {
    pub fn client(&self) -> &Arc<dyn AiClient> {
        &self.client
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.manager.release(&self.client, &self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::ClientCore;
    use crate::ai::types::{AiError, ChatMessage, ChatResponse};
    use async_trait::async_trait;

    struct FakeClient {
        core: ClientCore,
    }

    impl FakeClient {
        fn new(name: &str, group: &str, priority: ClientPriority, available: bool) -> Arc<Self> {
            Arc::new(Self {
                core: ClientCore::new(name, group, priority, available, 0.0),
            })
        }
    }

    #[async_trait]
    impl AiClient for FakeClient {
        fn core(&self) -> &ClientCore {
            &self.core
        }

        fn current_model(&self) -> String {
            "fake".to_string()
        }

        fn current_base_url(&self) -> String {
            "http://fake".to_string()
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<ChatResponse, AiError> {
            Ok(ChatResponse {
                content: "{}".to_string(),
                model: "fake".to_string(),
            })
        }
    }

    #[test]
    fn test_acquire_prefers_freebie_over_expensive() {
        let manager = AiClientManager::new();
        manager.register_client(FakeClient::new("paid", "g1", ClientPriority::Expensive, true));
        manager.register_client(FakeClient::new("free", "g2", ClientPriority::Freebie, true));

        let lease = manager.get_available_client("test").unwrap();
        assert_eq!(lease.client().name(), "free");
    }

    #[test]
    fn test_acquire_skips_unavailable() {
        let manager = AiClientManager::new();
        manager.register_client(FakeClient::new("down", "g", ClientPriority::Freebie, false));
        manager.register_client(FakeClient::new("up", "g", ClientPriority::Expensive, true));

        let lease = manager.get_available_client("test").unwrap();
        assert_eq!(lease.client().name(), "up");
    }

    #[test]
    fn test_group_limit_is_enforced_and_released() {
        let manager = AiClientManager::new();
        manager.register_client(FakeClient::new("a", "sf", ClientPriority::Normal, true));
        manager.register_client(FakeClient::new("b", "sf", ClientPriority::Normal, true));
        manager.set_group_limit("sf", 1);

        let lease = manager.get_available_client("w0").unwrap();
        assert_eq!(manager.group_in_flight("sf"), 1);
        assert!(manager.get_available_client("w1").is_none());

        drop(lease);
        assert_eq!(manager.group_in_flight("sf"), 0);
        assert!(manager.get_available_client("w1").is_some());
    }

    #[test]
    fn test_prefers_smaller_in_flight_within_class() {
        let manager = AiClientManager::new();
        manager.register_client(FakeClient::new("a", "g", ClientPriority::Normal, true));
        manager.register_client(FakeClient::new("b", "g", ClientPriority::Normal, true));

        let lease_a = manager.get_available_client("w0").unwrap();
        let first = lease_a.client().name().to_string();
        let lease_b = manager.get_available_client("w1").unwrap();
        let second = lease_b.client().name().to_string();
        assert_ne!(first, second, "second lease must go to the idle client");
    }

    #[test]
    fn test_lease_drop_always_releases_in_flight() {
        let manager = AiClientManager::new();
        manager.register_client(FakeClient::new("a", "g", ClientPriority::Normal, true));

        {
            let lease = manager.get_available_client("w").unwrap();
            assert_eq!(lease.client().in_flight(), 1);
        }
        let snapshot = manager.snapshot();
        assert_eq!(snapshot[0].in_flight, 0);
    }

    #[test]
    fn test_no_clients_yields_none() {
        let manager = AiClientManager::new();
        assert!(manager.get_available_client("w").is_none());
    }
}
