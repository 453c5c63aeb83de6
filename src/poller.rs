//! One task per configured price.
//!
//! A poller starts in [`PollerState::WarmingUp`], retrying the real fetch
//! with exponential backoff until the first valid price lands in the store.
//! It then runs [`PollerState::Steady`] forever: every wander interval it
//! refetches the real price once the poll interval has elapsed, and, for
//! wandering prices, nudges the stored value with the wander model.

use crate::clock::Clock;
use crate::config::PriceConfig;
use crate::error::FetchError;
use crate::sources::RegisteredSource;
use crate::store::PriceStore;
use crate::types::PriceInfo;
use crate::wander::WanderModel;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    WarmingUp,
    Steady,
}

/// Exponential retry delay used while warming up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    /// Delay after the `attempt`-th consecutive failure (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

pub struct Poller {
    price: Arc<PriceConfig>,
    source: RegisteredSource,
    store: Arc<PriceStore>,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    model: WanderModel,
    rng: StdRng,
    state: PollerState,
    last_real: Option<PriceInfo>,
    last_real_at: Option<Instant>,
}

impl Poller {
    pub fn new(
        price: Arc<PriceConfig>,
        source: RegisteredSource,
        store: Arc<PriceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let model = WanderModel::new(source.descriptor.sleep_real as f64);
        Self {
            price,
            source,
            store,
            clock,
            backoff: Backoff::default(),
            model,
            rng: StdRng::from_entropy(),
            state: PollerState::WarmingUp,
            last_real: None,
            last_real_at: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[cfg(test)]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Run until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = self.warm_up() => {}
        }

        let wander_interval = self.source.descriptor.wander_interval();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wander_interval) => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
        }
        debug!("poller stopped");
    }

    /// Fetch until the first valid real price is stored.
    pub async fn warm_up(&mut self) {
        let mut attempt: u32 = 0;
        while self.state == PollerState::WarmingUp {
            self.acquire_token().await;
            match self.fetch_real().await {
                Ok(info) => {
                    self.accept_real(info);
                    self.state = PollerState::Steady;
                    debug!(
                        price = info.price,
                        attempts = attempt + 1,
                        "fetched real price for the first time"
                    );
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    debug!(
                        error = %e,
                        attempt,
                        ?delay,
                        "failed to fetch real price for the first time"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// One steady-state step: refetch when due, then wander if configured.
    pub async fn tick(&mut self) {
        let poll_interval = self.source.descriptor.poll_interval();
        let due = self
            .last_real_at
            .map_or(true, |at| at.elapsed() >= poll_interval);
        if due {
            self.acquire_token().await;
            match self.fetch_real().await {
                Ok(info) => {
                    self.accept_real(info);
                    debug!(price = info.price, "fetched real price");
                }
                Err(e) => warn!(error = %e, "failed to fetch real price"),
            }
        }

        if self.price.wander {
            self.wander();
        }
    }

    async fn acquire_token(&self) {
        let limiter = &self.source.limiter;
        if let Err(e) = limiter.acquire().await {
            warn!(error = %e, "rate limiter wait too long, falling back to sleep");
            tokio::time::sleep(limiter.interval()).await;
            limiter.acquire_unbounded().await;
        }
    }

    async fn fetch_real(&self) -> Result<PriceInfo, FetchError> {
        let info = self
            .source
            .adapter
            .fetch(&self.price, &self.source.descriptor)
            .await?;
        if !info.is_valid() {
            return Err(FetchError::NonPositive {
                provider: self.source.descriptor.provider.as_str(),
                base: self.price.base.clone(),
                quote: self.price.quote.clone(),
                price: info.price,
            });
        }
        Ok(info)
    }

    fn accept_real(&mut self, info: PriceInfo) {
        self.store.upsert(&self.price, info);
        self.last_real = Some(info);
        self.last_real_at = Some(Instant::now());
    }

    fn wander(&mut self) {
        let Some(real) = self.last_real else {
            return;
        };
        let Some(current) = self.store.get(&self.price.key()) else {
            warn!("no stored price to wander");
            return;
        };

        let next = PriceInfo {
            price: self.model.sample(&mut self.rng, real.price, current.price),
            last_updated_real: current.last_updated_real,
            last_updated_wander: self.clock.now(),
        };
        if !next.is_valid() {
            debug!(price = next.price, "discarding unusable wandered price");
            return;
        }
        self.store.upsert(&self.price, next);
        debug!(
            kappa = self.model.kappa(),
            previous = current.price,
            price = next.price,
            "wandered price"
        );
    }
}
