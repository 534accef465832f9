//! Static-token access control.
//!
//! Three token sets guard the service: RPC queries, collectors submitting
//! raw items, and processors submitting pre-analyzed items. A token is
//! accepted either as a bearer in the `Authorization` header or as a
//! `token` field in the request body. An empty configured set denies every
//! request for that role (deny-by-default).

use axum::http::HeaderMap;

use crate::config::WebServiceConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRole {
    RpcApi,
    Collector,
    Processor,
}

impl AccessRole {
    fn as_str(&self) -> &'static str {
        match self {
            AccessRole::RpcApi => "rpc_api",
            AccessRole::Collector => "collector",
            AccessRole::Processor => "processor",
        }
    }
}

pub struct AccessManager {
    rpc_api: Vec<String>,
    collector: Vec<String>,
    processor: Vec<String>,
}

impl AccessManager {
    pub fn from_config(config: &WebServiceConfig) -> Self {
        Self {
            rpc_api: config.rpc_api.tokens.clone(),
            collector: config.collector.tokens.clone(),
            processor: config.processor.tokens.clone(),
        }
    }

    /// Direct construction from explicit token sets.
    pub fn with_tokens(
        rpc_api: Vec<String>,
        collector: Vec<String>,
        processor: Vec<String>,
    ) -> Self {
        Self {
            rpc_api,
            collector,
            processor,
        }
    }

    fn tokens_for(&self, role: AccessRole) -> &[String] {
        match role {
            AccessRole::RpcApi => &self.rpc_api,
            AccessRole::Collector => &self.collector,
            AccessRole::Processor => &self.processor,
        }
    }

    /// Verifies a request against one role's token set.
    pub fn verify(
        &self,
        role: AccessRole,
        headers: &HeaderMap,
        body_token: Option<&str>,
    ) -> Result<()> {
        let accepted = self.tokens_for(role);
        if accepted.is_empty() {
            // No tokens configured means nobody gets in
            return Err(Error::Unauthorized(format!(
                "No {} tokens configured, access denied",
                role.as_str()
            )));
        }

        let header_token = bearer_token(headers);
        let candidates = [header_token.as_deref(), body_token];
        for candidate in candidates.into_iter().flatten() {
            if accepted.iter().any(|token| token == candidate) {
                return Ok(());
            }
        }
        Err(Error::Unauthorized(format!(
            "Invalid or missing {} token",
            role.as_str()
        )))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?;
    let value = value.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value);
    Some(token.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AccessManager {
        AccessManager::with_tokens(
            vec!["rpc-token".to_string()],
            vec!["collector-token".to_string()],
            vec![],
        )
    }

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", token).parse().unwrap(),
        );
        headers
    }

    #[test]
    fn test_header_token_accepted() {
        let manager = manager();
        let headers = headers_with_bearer("rpc-token");
        assert!(manager.verify(AccessRole::RpcApi, &headers, None).is_ok());
    }

    #[test]
    fn test_body_token_accepted() {
        let manager = manager();
        let headers = HeaderMap::new();
        assert!(
            manager
                .verify(AccessRole::Collector, &headers, Some("collector-token"))
                .is_ok()
        );
    }

    #[test]
    fn test_wrong_token_rejected() {
        let manager = manager();
        let headers = headers_with_bearer("rpc-token");
        // Valid RPC token does not open the collector door
        assert!(
            manager
                .verify(AccessRole::Collector, &headers, None)
                .is_err()
        );
    }

    #[test]
    fn test_empty_set_denies_everything() {
        let manager = manager();
        let headers = headers_with_bearer("anything");
        assert!(
            manager
                .verify(AccessRole::Processor, &headers, Some("anything"))
                .is_err()
        );
    }

    #[test]
    fn test_raw_authorization_value_accepted() {
        let manager = manager();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "rpc-token".parse().unwrap(),
        );
        assert!(manager.verify(AccessRole::RpcApi, &headers, None).is_ok());
    }
}
