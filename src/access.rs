// ============================================================================
// ACCESS CHECK
// ============================================================================
// A single allow/deny decision taken before any aggregated report is built.
// Identity itself belongs to an external provider; policies here only match
// the credential it issued.
// ============================================================================

use std::collections::HashSet;
use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AccessConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AccessDecision {
    Allow,
    Deny { reason: String },
}

impl AccessDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        AccessDecision::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow)
    }
}

/// Decides whether a caller may see aggregated reports.
#[async_trait]
pub trait AccessPolicy: Send + Sync + Debug {
    async fn authorize(&self, credentials: Option<&str>) -> AccessDecision;
}

/// Lets everyone through. For tests and local development.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl AccessPolicy for AllowAll {
    async fn authorize(&self, _credentials: Option<&str>) -> AccessDecision {
        AccessDecision::Allow
    }
}

/// Admits callers presenting one of a fixed set of admin bearer tokens.
#[derive(Debug, Clone)]
pub struct StaticTokenPolicy {
    tokens: HashSet<String>,
    allow_anonymous: bool,
}

impl StaticTokenPolicy {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().filter(|t| !t.is_empty()).collect(),
            allow_anonymous: false,
        }
    }

    pub fn from_config(config: &AccessConfig) -> Self {
        let mut policy = Self::new(config.admin_tokens.iter().cloned());
        policy.allow_anonymous = config.allow_anonymous;

        if policy.tokens.is_empty() && !policy.allow_anonymous {
            warn!(target: "pulse::access", "No admin tokens configured; every report request will be denied");
        }
        policy
    }
}

#[async_trait]
impl AccessPolicy for StaticTokenPolicy {
    async fn authorize(&self, credentials: Option<&str>) -> AccessDecision {
        match credentials.map(str::trim).filter(|c| !c.is_empty()) {
            Some(token) if self.tokens.contains(token) => AccessDecision::Allow,
            Some(_) => {
                debug!(target: "pulse::access", "Rejected unrecognized credentials");
                AccessDecision::deny("credentials are not authorized for admin reports")
            }
            None if self.allow_anonymous => AccessDecision::Allow,
            None => AccessDecision::deny("admin credentials required"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_tokens() {
        let policy = StaticTokenPolicy::new(["s3cret".to_string()]);

        assert!(policy.authorize(Some("s3cret")).await.is_allowed());
        assert!(policy.authorize(Some(" s3cret ")).await.is_allowed());
        assert!(!policy.authorize(Some("guess")).await.is_allowed());
        assert_eq!(
            policy.authorize(None).await,
            AccessDecision::deny("admin credentials required")
        );
    }

    #[tokio::test]
    async fn test_anonymous_access_from_config() {
        let config = AccessConfig {
            admin_tokens: Vec::new(),
            allow_anonymous: true,
        };
        let policy = StaticTokenPolicy::from_config(&config);
        assert!(policy.authorize(None).await.is_allowed());
        assert!(!policy.authorize(Some("anything")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAll.authorize(None).await.is_allowed());
    }
}
