pub mod bitstamp;
pub mod coingecko;
pub mod coinmarketcap;
pub mod template;

use crate::clock::Clock;
use crate::config::PriceConfig;
use crate::error::{FetchError, RegistryError};
use crate::rate_limit::RateLimiter;
use crate::types::{PriceInfo, ProviderKind, SourceDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Fetches the real price of one configured pair from one source.
///
/// Implementations issue a single request per call, apply the price's
/// `factor`, and fail rather than return a non-positive price.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    /// Inert sources have no schema to parse and are never polled.
    fn is_inert(&self) -> bool {
        false
    }

    async fn fetch(
        &self,
        price: &PriceConfig,
        source: &SourceDescriptor,
    ) -> Result<PriceInfo, FetchError>;
}

/// A configured source with its adapter and the limiter shared by all of
/// its pollers.
#[derive(Clone)]
pub struct RegisteredSource {
    pub descriptor: SourceDescriptor,
    pub adapter: Arc<dyn PriceSource>,
    pub limiter: Arc<RateLimiter>,
}

pub struct SourceRegistry {
    sources: HashMap<String, RegisteredSource>,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    acquire_timeout: Duration,
}

impl SourceRegistry {
    pub fn new(client: reqwest::Client, clock: Arc<dyn Clock>, acquire_timeout: Duration) -> Self {
        Self {
            sources: HashMap::new(),
            client,
            clock,
            acquire_timeout,
        }
    }

    /// Register a source, picking its adapter from the descriptor's provider.
    pub fn add_source(&mut self, descriptor: SourceDescriptor) -> Result<(), RegistryError> {
        let api_key = resolve_credential(&descriptor);
        let client = self.client.clone();
        let clock = Arc::clone(&self.clock);
        let adapter: Arc<dyn PriceSource> = match descriptor.provider {
            ProviderKind::Coingecko => Arc::new(coingecko::CoinGecko::new(client, clock, api_key)),
            ProviderKind::Coinmarketcap => {
                Arc::new(coinmarketcap::CoinMarketCap::new(client, clock, api_key))
            }
            ProviderKind::Bitstamp => Arc::new(bitstamp::Bitstamp::new(client, clock)),
            ProviderKind::Template => Arc::new(template::Template::new()),
        };
        self.add_source_with(descriptor, adapter)
    }

    /// Register a source with an explicitly supplied adapter.
    pub fn add_source_with(
        &mut self,
        descriptor: SourceDescriptor,
        adapter: Arc<dyn PriceSource>,
    ) -> Result<(), RegistryError> {
        if descriptor.sleep_real == 0 {
            return Err(RegistryError::InvalidInterval {
                source_name: descriptor.name,
                field: "sleep_real",
            });
        }
        if descriptor.sleep_wander == 0 {
            return Err(RegistryError::InvalidInterval {
                source_name: descriptor.name,
                field: "sleep_wander",
            });
        }
        if self.sources.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateSource(descriptor.name));
        }

        let limiter = Arc::new(RateLimiter::new(
            descriptor.name.clone(),
            descriptor.poll_interval(),
            self.acquire_timeout,
        ));
        self.sources.insert(
            descriptor.name.clone(),
            RegisteredSource {
                descriptor,
                adapter,
                limiter,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&RegisteredSource, RegistryError> {
        self.sources
            .get(name)
            .ok_or_else(|| RegistryError::SourceNotFound(name.to_string()))
    }

    pub fn get_source(&self, name: &str) -> Result<&SourceDescriptor, RegistryError> {
        self.get(name).map(|s| &s.descriptor)
    }

    /// All descriptors, ordered by name.
    pub fn list_sources(&self) -> Vec<SourceDescriptor> {
        let mut list: Vec<SourceDescriptor> =
            self.sources.values().map(|s| s.descriptor.clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

fn resolve_credential(descriptor: &SourceDescriptor) -> Option<String> {
    let env_name = descriptor.auth_key_env_name.as_deref()?;
    match std::env::var(env_name) {
        Ok(key) if !key.is_empty() => Some(key),
        _ => {
            warn!(
                source = %descriptor.name,
                auth_key_env_name = env_name,
                "API key is empty; export the variable named by auth_key_env_name"
            );
            None
        }
    }
}

/// GET a URL and decode the JSON body, mapping every failure to a fetch error.
pub(crate) async fn get_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    provider: &'static str,
) -> Result<T, FetchError> {
    let resp = request
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|source| FetchError::Transport { provider, source })?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(FetchError::Status {
            provider,
            status,
            body,
        });
    }

    let bytes = resp
        .bytes()
        .await
        .map_err(|source| FetchError::Transport { provider, source })?;
    serde_json::from_slice(&bytes).map_err(|e| FetchError::parse(provider, e))
}

/// Apply the configured factor and reject anything that is not a usable price.
pub(crate) fn finish(
    provider: &'static str,
    price: &PriceConfig,
    raw: f64,
    observed_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<PriceInfo, FetchError> {
    let info = PriceInfo::real(raw * price.factor, observed_at, now);
    if !info.is_valid() {
        return Err(FetchError::NonPositive {
            provider,
            base: price.base.clone(),
            quote: price.quote.clone(),
            price: info.price,
        });
    }
    Ok(info)
}
