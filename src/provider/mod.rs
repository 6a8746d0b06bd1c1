//! Remote key fetcher — the client half of the relay.
//!
//! For processes that cannot run their own poller: fetches the credential
//! from a key endpoint, caches it per provider name with an expiry derived
//! from the response, and never issues more than one request at a time.

pub mod cache;
pub mod response;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::DynamicKeyConfig;
use crate::error::{RelayError, Result};

pub use cache::{CacheEntry, KeyCache};
pub use response::{normalize, KeyGrant};

pub struct RemoteKeyFetcher {
    config: DynamicKeyConfig,
    headers: HeaderMap,
    cache: KeyCache,
    /// Built lazily; `close` drops it.
    client: Mutex<Option<reqwest::Client>>,
}

impl RemoteKeyFetcher {
    pub fn new(config: DynamicKeyConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: DynamicKeyConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let headers = build_headers(&config)?;
        Ok(Self {
            config,
            headers,
            cache: KeyCache::new(clock),
            client: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DynamicKeyConfig {
        &self.config
    }

    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Return a valid key for `provider`, hitting the network only on a
    /// miss or after expiry.
    pub async fn fetch(&self, provider: &str) -> Result<String> {
        self.cache
            .get_or_fetch(provider, move || self.request(provider))
            .await
    }

    pub async fn clear_cache(&self, provider: Option<&str>) {
        self.cache.clear(provider).await;
    }

    /// Release pooled connections. Safe to call repeatedly; a later `fetch`
    /// opens a new client.
    pub fn close(&self) {
        let mut client = self.client.lock().unwrap_or_else(|e| e.into_inner());
        if client.take().is_some() {
            tracing::debug!("Key endpoint client closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn client(&self) -> Result<reqwest::Client> {
        let mut slot = self.client.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .default_headers(self.headers.clone())
            .timeout(self.config.timeout())
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {}", e)))?;
        *slot = Some(client.clone());
        Ok(client)
    }

    fn endpoint_for(&self, provider: &str) -> String {
        self.config
            .endpoint_url
            .replace("{provider}", provider)
            .trim_end_matches('/')
            .to_string()
    }

    async fn request(&self, provider: &str) -> Result<KeyGrant> {
        let client = self.client()?;
        let url = self.endpoint_for(provider);
        info!(provider, url = %url, "Fetching API key");

        let fetch_error = |status: Option<u16>, cause: String| RelayError::KeyFetch {
            provider: provider.to_string(),
            status,
            cause,
        };

        let resp = client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                fetch_error(None, format!("request to {} timed out", url))
            } else {
                fetch_error(
                    e.status().map(|s| s.as_u16()),
                    format!("could not reach {}: {}", url, e),
                )
            }
        })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| {
            fetch_error(
                Some(status.as_u16()),
                format!("failed to read response body: {}", e),
            )
        })?;

        if !status.is_success() {
            return Err(fetch_error(
                Some(status.as_u16()),
                format!("HTTP {}: {}", status.as_u16(), body),
            ));
        }

        let grant = normalize(
            provider,
            &body,
            self.config.cache_duration_seconds,
            self.config.rotation_cadence_seconds,
        )?;
        info!(
            provider,
            expires_in = grant.expires_in,
            "Fetched and cached API key"
        );
        Ok(grant)
    }
}

fn build_headers(config: &DynamicKeyConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    if let Some(extra) = &config.headers {
        for (name, value) in extra {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RelayError::Config(format!("invalid header name {:?}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RelayError::Config(format!("invalid value for header {}: {}", name, e)))?;
            headers.insert(name, value);
        }
    }

    if let Some(token) = &config.auth_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| RelayError::Config("auth token is not a valid header value".into()))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Ok(headers)
}
