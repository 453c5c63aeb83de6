use crate::clock::Clock;
use crate::config::PriceConfig;
use crate::error::RegistryError;
use crate::poller::{Backoff, Poller};
use crate::sources::SourceRegistry;
use crate::store::PriceStore;
use crate::types::{PriceInfo, PriceKey, SourceDescriptor};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

/// Register every configured source, resolving each adapter once.
pub fn build_registry(
    descriptors: Vec<SourceDescriptor>,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    acquire_timeout: Duration,
) -> Result<SourceRegistry, RegistryError> {
    let mut registry = SourceRegistry::new(client, clock, acquire_timeout);
    for descriptor in descriptors {
        let name = descriptor.name.clone();
        let provider = descriptor.provider;
        let sleep_real = descriptor.sleep_real;
        registry.add_source(descriptor)?;
        info!(name = %name, provider = provider.as_str(), sleep_real, "Added source");
    }
    Ok(registry)
}

/// Owns the pollers; hands out read access to the store and registry.
pub struct PriceEngine {
    registry: Arc<SourceRegistry>,
    store: Arc<PriceStore>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PriceEngine {
    /// Spawn one poller per price. Prices on inert sources are skipped.
    pub fn start(
        registry: SourceRegistry,
        prices: Vec<PriceConfig>,
        clock: Arc<dyn Clock>,
        backoff: Backoff,
    ) -> Result<Self, RegistryError> {
        let registry = Arc::new(registry);
        let store = Arc::new(PriceStore::new());
        let cancel = CancellationToken::new();
        // resolve every source up front so a bad name leaves nothing running
        let resolved = prices
            .into_iter()
            .map(|price| -> Result<_, RegistryError> {
                let source = registry.get(&price.source)?.clone();
                Ok((price, source))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut tasks = Vec::with_capacity(resolved.len());
        for (price, source) in resolved {
            if source.adapter.is_inert() {
                warn!(
                    source = %price.source,
                    base = %price.base,
                    quote = %price.quote,
                    provider = source.adapter.name(),
                    "source has no price schema; price will never be populated"
                );
                continue;
            }

            let span = info_span!(
                "poller",
                source = %price.source,
                base = %price.base,
                quote = %price.quote
            );
            let poller = Poller::new(
                Arc::new(price),
                source,
                Arc::clone(&store),
                Arc::clone(&clock),
            )
            .with_backoff(backoff);
            tasks.push(tokio::spawn(poller.run(cancel.child_token()).instrument(span)));
        }

        info!(pollers = tasks.len(), sources = registry.source_count(), "price engine started");
        Ok(Self {
            registry,
            store,
            cancel,
            tasks,
        })
    }

    pub fn store(&self) -> Arc<PriceStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<SourceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn poller_count(&self) -> usize {
        self.tasks.len()
    }

    /// Poll the store with a 10ms doubling backoff until the key has a price
    /// or `timeout` elapses.
    pub async fn wait_for_first_price(
        &self,
        key: &PriceKey,
        timeout: Duration,
    ) -> Option<PriceInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(10);
        loop {
            if let Some(info) = self.store.get(key) {
                return Some(info);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = delay.saturating_mul(2);
        }
    }

    /// Cancel every poller and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "poller task ended abnormally");
            }
        }
        info!(prices = self.store.len(), "price engine stopped");
    }
}
