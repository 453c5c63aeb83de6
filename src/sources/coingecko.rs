use super::{finish, get_json, PriceSource};
use crate::clock::Clock;
use crate::config::PriceConfig;
use crate::error::FetchError;
use crate::types::{PriceInfo, SourceDescriptor};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const PROVIDER: &str = "coingecko";

/// Common denominations tried for a cross conversion, in priority order.
const CROSS_PRIORITY: [&str; 5] = ["usd", "eur", "dai", "btc", "eth"];

pub struct CoinGecko {
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    api_key: Option<String>,
}

impl CoinGecko {
    pub fn new(client: reqwest::Client, clock: Arc<dyn Clock>, api_key: Option<String>) -> Self {
        Self {
            client,
            clock,
            api_key,
        }
    }
}

/// One entry of a `simple/price` response.
#[derive(Debug, Clone, Default, Deserialize)]
struct CoinRecord {
    usd: Option<f64>,
    eur: Option<f64>,
    dai: Option<f64>,
    btc: Option<f64>,
    eth: Option<f64>,
    last_updated_at: Option<i64>,
}

impl CoinRecord {
    fn quote(&self, name: &str) -> Option<f64> {
        match name.to_ascii_lowercase().as_str() {
            "usd" => self.usd,
            "eur" => self.eur,
            "dai" => self.dai,
            "btc" => self.btc,
            "eth" => self.eth,
            _ => None,
        }
    }
}

type PriceBoard = HashMap<String, CoinRecord>;

fn record<'a>(board: &'a PriceBoard, symbol: &str) -> Option<&'a CoinRecord> {
    board.get(symbol).or_else(|| {
        board
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(symbol))
            .map(|(_, v)| v)
    })
}

/// Derive base/quote through the first denomination both records carry.
fn cross_price(base: &CoinRecord, quote: &CoinRecord) -> Option<f64> {
    CROSS_PRIORITY.iter().find_map(|denom| {
        let b = base.quote(denom).filter(|v| *v > 0.0)?;
        let q = quote.quote(denom).filter(|v| *v > 0.0)?;
        Some(b / q)
    })
}

fn resolve(board: &PriceBoard, price: &PriceConfig) -> Result<(f64, Option<i64>), FetchError> {
    let base = record(board, &price.base).ok_or_else(|| FetchError::PairNotFound {
        provider: PROVIDER,
        base: price.base.clone(),
        quote: price.quote.clone(),
    })?;

    if let Some(direct) = base.quote(&price.quote).filter(|v| *v > 0.0) {
        return Ok((direct, base.last_updated_at));
    }

    debug!(
        base = %price.base,
        quote = %price.quote,
        "Quote/Base rate not found directly, trying conversion"
    );
    record(board, &price.quote)
        .and_then(|quote| cross_price(base, quote))
        .map(|p| (p, base.last_updated_at))
        .ok_or_else(|| FetchError::ConversionNotFound {
            provider: PROVIDER,
            base: price.base.clone(),
            quote: price.quote.clone(),
        })
}

#[async_trait]
impl PriceSource for CoinGecko {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn fetch(
        &self,
        price: &PriceConfig,
        source: &SourceDescriptor,
    ) -> Result<PriceInfo, FetchError> {
        let mut request = self.client.get(source.url_for(&price.key()));
        if let Some(key) = &self.api_key {
            request = request.header("x-cg-demo-api-key", key);
        }
        let board: PriceBoard = get_json(request, PROVIDER).await?;

        let (raw, updated_at) = resolve(&board, price)?;
        let now = self.clock.now();
        let observed_at = updated_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or(now);
        finish(PROVIDER, price, raw, observed_at, now)
    }
}
