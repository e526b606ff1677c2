// Bearer token sources for the push channel.

use anyhow::{bail, Result};
use async_trait::async_trait;

/// Supplies a fresh bearer token on every call. An empty token counts as a
/// failure.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<String>;
}

/// Reads the token from an environment variable at call time, so a token
/// rotated by the launcher is picked up on the next retry.
#[derive(Debug, Clone)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn fetch_token(&self) -> Result<String> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(token),
            Ok(_) => bail!("{} is empty", self.var),
            Err(_) => bail!("{} is not set", self.var),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
