use super::{finish, get_json, PriceSource};
use crate::clock::Clock;
use crate::config::PriceConfig;
use crate::error::FetchError;
use crate::types::{PriceInfo, SourceDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;

const PROVIDER: &str = "bitstamp";

pub struct Bitstamp {
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl Bitstamp {
    pub fn new(client: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        Self { client, clock }
    }
}

/// Pick the ticker for the configured pair. A single-pair endpoint returns
/// one object; the all-pairs endpoint returns an array tagged with `pair`.
fn select_ticker<'a>(body: &'a Value, price: &PriceConfig) -> Option<&'a Value> {
    match body {
        Value::Object(_) => Some(body),
        Value::Array(tickers) => tickers.iter().find(|t| {
            t.get("pair")
                .and_then(Value::as_str)
                .and_then(|pair| pair.split_once('/'))
                .map(|(base, quote)| {
                    base.eq_ignore_ascii_case(&price.base)
                        && quote.eq_ignore_ascii_case(&price.quote)
                })
                .unwrap_or(false)
        }),
        _ => None,
    }
}

fn parse_last(ticker: &Value) -> Result<f64, FetchError> {
    let last = ticker
        .get("last")
        .ok_or_else(|| FetchError::parse(PROVIDER, "missing last"))?;
    match last {
        Value::String(s) if s.trim().is_empty() => Err(FetchError::parse(PROVIDER, "empty last")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| FetchError::parse(PROVIDER, format!("last '{}': {}", s, e))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| FetchError::parse(PROVIDER, "last out of range")),
        other => Err(FetchError::parse(PROVIDER, format!("last has unexpected type: {}", other))),
    }
}

fn parse_timestamp(ticker: &Value) -> Option<DateTime<Utc>> {
    let secs = match ticker.get("timestamp")? {
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    Utc.timestamp_opt(secs, 0).single()
}

#[async_trait]
impl PriceSource for Bitstamp {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn fetch(
        &self,
        price: &PriceConfig,
        source: &SourceDescriptor,
    ) -> Result<PriceInfo, FetchError> {
        let request = self.client.get(source.url_for(&price.key()));
        let body: Value = get_json(request, PROVIDER).await?;

        let ticker = select_ticker(&body, price).ok_or_else(|| FetchError::PairNotFound {
            provider: PROVIDER,
            base: price.base.clone(),
            quote: price.quote.clone(),
        })?;
        let raw = parse_last(ticker)?;

        let now = self.clock.now();
        let observed_at = parse_timestamp(ticker).unwrap_or(now);
        finish(PROVIDER, price, raw, observed_at, now)
    }
}
