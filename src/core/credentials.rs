//! Credential resolution.
//!
//! Steps name the credentials they need; values are resolved right before
//! the runner is invoked and never written to the fact log. Resolved values
//! may be cached for a short time; a miss always falls back to the provider.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

/// Credential lookup failures
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Failed to resolve credential {name}: {reason}")]
    Resolution { name: String, reason: String },
}

/// Resolves a named credential to its secret value
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<String, CredentialError>;
}

/// Reads `PIPEWRIGHT_CREDENTIAL_<NAME>` environment variables
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialProvider;

impl EnvCredentialProvider {
    pub fn variable_name(name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("PIPEWRIGHT_CREDENTIAL_{}", normalized)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn resolve(&self, name: &str) -> Result<String, CredentialError> {
        let variable = Self::variable_name(name);
        match std::env::var(&variable) {
            Ok(value) => Ok(value),
            Err(std::env::VarError::NotPresent) => Err(CredentialError::NotFound(name.to_string())),
            Err(std::env::VarError::NotUnicode(_)) => Err(CredentialError::Resolution {
                name: name.to_string(),
                reason: format!("{} is not valid unicode", variable),
            }),
        }
    }
}

struct CachedCredential {
    value: String,
    fetched_at: Instant,
}

impl CachedCredential {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// Process-wide TTL cache in front of another provider
pub struct CachedCredentialProvider {
    inner: Arc<dyn CredentialProvider>,
    ttl: Duration,
    cache: DashMap<String, CachedCredential>,
}

impl CachedCredentialProvider {
    pub fn new(inner: Arc<dyn CredentialProvider>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: DashMap::new(),
        }
    }

    /// Drop a cached value so the next lookup goes to the provider
    pub fn invalidate(&self, name: &str) {
        self.cache.remove(name);
    }
}

#[async_trait]
impl CredentialProvider for CachedCredentialProvider {
    async fn resolve(&self, name: &str) -> Result<String, CredentialError> {
        if let Some(cached) = self.cache.get(name) {
            if cached.is_fresh(self.ttl) {
                return Ok(cached.value.clone());
            }
        }

        debug!(credential = name, "Resolving credential");
        let value = self.inner.resolve(name).await?;
        self.cache.insert(
            name.to_string(),
            CachedCredential {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for Counting {
        async fn resolve(&self, name: &str) -> Result<String, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}-{}", name, n))
        }
    }

    #[tokio::test]
    async fn test_cache_hits_within_ttl() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedCredentialProvider::new(inner.clone(), Duration::from_secs(60));

        assert_eq!(cached.resolve("gh").await.unwrap(), "gh-0");
        assert_eq!(cached.resolve("gh").await.unwrap(), "gh-0");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        cached.invalidate("gh");
        assert_eq!(cached.resolve("gh").await.unwrap(), "gh-1");
    }

    #[tokio::test]
    async fn test_expired_entry_is_refreshed() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedCredentialProvider::new(inner.clone(), Duration::ZERO);

        cached.resolve("gh").await.unwrap();
        cached.resolve("gh").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_env_provider() {
        assert_eq!(
            EnvCredentialProvider::variable_name("my-token"),
            "PIPEWRIGHT_CREDENTIAL_MY_TOKEN"
        );
        std::env::set_var("PIPEWRIGHT_CREDENTIAL_UNIT_TEST_TOKEN", "s3cret");
        let value = EnvCredentialProvider.resolve("unit_test_token").await.unwrap();
        assert_eq!(value, "s3cret");

        let missing = EnvCredentialProvider.resolve("definitely_missing_credential").await;
        assert!(matches!(missing, Err(CredentialError::NotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_provider_rejects_non_unicode() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        std::env::set_var("PIPEWRIGHT_CREDENTIAL_BINARY_TOKEN", OsStr::from_bytes(&[0x66, 0xff]));
        match EnvCredentialProvider.resolve("binary_token").await {
            Err(CredentialError::Resolution { name, reason }) => {
                assert_eq!(name, "binary_token");
                assert!(reason.contains("PIPEWRIGHT_CREDENTIAL_BINARY_TOKEN"));
            }
            other => panic!("expected a resolution error, got {:?}", other),
        }
    }
}
