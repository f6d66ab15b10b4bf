//! Verification key cache.
//!
//! The gateway never talks to the controller on the hot path: it fetches
//! the JWKS document at startup, caches the verifier, and refreshes it in
//! the background within the document's cache ceiling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::RwLock;

use tether_core::token::{Claims, JwksDocument, TokenError, Verifier};

#[derive(Clone)]
pub struct KeySource {
    inner: Arc<RwLock<Verifier>>,
}

impl KeySource {
    /// Wrap an already-built verifier (tests, embedded setups).
    pub fn new(verifier: Verifier) -> Self {
        Self {
            inner: Arc::new(RwLock::new(verifier)),
        }
    }

    /// Fetch the JWKS document, retrying up to `attempts` times at startup.
    pub async fn fetch(client: &reqwest::Client, url: &str, attempts: u32) -> Result<Self> {
        let mut last_err = None;
        for attempt in 1..=attempts.max(1) {
            match fetch_document(client, url).await {
                Ok(doc) => {
                    let verifier = Verifier::from_jwks(&doc)
                        .map_err(|e| anyhow::anyhow!("unusable JWKS from {url}: {e}"))?;
                    tracing::info!(%url, attempt, "verification keys loaded");
                    return Ok(Self::new(verifier));
                }
                Err(e) => {
                    tracing::warn!(%url, attempt, error = %e, "JWKS fetch failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no JWKS fetch attempt made")))
    }

    pub async fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        self.inner.read().await.verify(token)
    }

    /// Periodically re-fetch the key set. Failures keep the cached keys;
    /// the kid is stable for the controller's process lifetime, so a stale
    /// cache only matters across controller restarts.
    pub fn spawn_refresh(&self, client: reqwest::Client, url: String, every: Duration) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                match fetch_document(&client, &url).await {
                    Ok(doc) => match Verifier::from_jwks(&doc) {
                        Ok(verifier) => {
                            *inner.write().await = verifier;
                            tracing::debug!(%url, "refreshed verification keys");
                        }
                        Err(e) => {
                            tracing::warn!(%url, error = %e, "refreshed JWKS is unusable, keeping cached keys");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(%url, error = %e, "failed to refresh verification keys");
                    }
                }
            }
        });
    }
}

async fn fetch_document(client: &reqwest::Client, url: &str) -> Result<JwksDocument> {
    let doc = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("JWKS request to {url} failed"))?
        .error_for_status()
        .with_context(|| format!("JWKS request to {url} rejected"))?
        .json::<JwksDocument>()
        .await
        .with_context(|| format!("JWKS response from {url} unparsable"))?;
    Ok(doc)
}
