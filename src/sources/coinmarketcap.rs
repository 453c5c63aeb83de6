use super::{finish, get_json, PriceSource};
use crate::clock::Clock;
use crate::config::PriceConfig;
use crate::error::FetchError;
use crate::types::{PriceInfo, SourceDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const PROVIDER: &str = "coinmarketcap";

/// Denomination tried first when converting through a common currency.
const PREFERRED_DENOMINATION: &str = "USD";

pub struct CoinMarketCap {
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    api_key: Option<String>,
}

impl CoinMarketCap {
    pub fn new(client: reqwest::Client, clock: Arc<dyn Clock>, api_key: Option<String>) -> Self {
        Self {
            client,
            clock,
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct QuoteData {
    price: Option<f64>,
    last_updated: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CurrencyData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    slug: String,
    last_updated: Option<String>,
    #[serde(default)]
    quote: BTreeMap<String, QuoteData>,
}

impl CurrencyData {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.slug.eq_ignore_ascii_case(name)
            || self.symbol.eq_ignore_ascii_case(name)
    }

    fn quote_by_name(&self, name: &str) -> Option<&QuoteData> {
        self.quote
            .iter()
            .find(|(q, _)| q.eq_ignore_ascii_case(name))
            .map(|(_, data)| data)
    }

    fn positive_quote(&self, name: &str) -> Option<(f64, &QuoteData)> {
        let data = self.quote_by_name(name)?;
        data.price.filter(|p| *p > 0.0).map(|p| (p, data))
    }

    /// Quote currencies in conversion order: the preferred one, then the rest
    /// alphabetically.
    fn denominations(&self) -> impl Iterator<Item = (&String, &QuoteData)> {
        let preferred = self
            .quote
            .iter()
            .filter(|(q, _)| q.eq_ignore_ascii_case(PREFERRED_DENOMINATION));
        let rest = self
            .quote
            .iter()
            .filter(|(q, _)| !q.eq_ignore_ascii_case(PREFERRED_DENOMINATION));
        preferred.chain(rest)
    }
}

struct Resolved<'a> {
    price: f64,
    quote: Option<&'a QuoteData>,
    currency: &'a CurrencyData,
}

fn currencies(data: &Value) -> Vec<CurrencyData> {
    flatten_token_entries(data)
        .into_iter()
        .filter_map(|v| serde_json::from_value(v.clone()).ok())
        .collect()
}

fn flatten_token_entries(data: &Value) -> Vec<&Value> {
    match data {
        Value::Array(arr) => arr.iter().collect(),
        Value::Object(map) => map
            .values()
            .flat_map(|v| match v {
                Value::Array(arr) => arr.iter().collect::<Vec<_>>(),
                Value::Object(_) => vec![v],
                _ => Vec::new(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn currency<'a>(all: &'a [CurrencyData], name: &str) -> Option<&'a CurrencyData> {
    all.iter().find(|c| c.is(name))
}

/// Convert through at most one intermediate: a denomination both currencies
/// are quoted in, or the quote currency priced in the base.
fn convert<'a>(base: &'a CurrencyData, quote: &'a CurrencyData) -> Option<Resolved<'a>> {
    for (denom, base_in_denom) in base.denominations() {
        let Some(b) = base_in_denom.price.filter(|p| *p > 0.0) else {
            continue;
        };
        if let Some((q, _)) = quote.positive_quote(denom) {
            return Some(Resolved {
                price: b / q,
                quote: Some(base_in_denom),
                currency: base,
            });
        }
    }

    [&base.symbol, &base.slug, &base.name]
        .into_iter()
        .filter(|n| !n.is_empty())
        .find_map(|n| quote.positive_quote(n))
        .map(|(quote_in_base, data)| Resolved {
            price: 1.0 / quote_in_base,
            quote: Some(data),
            currency: quote,
        })
}

fn resolve<'a>(all: &'a [CurrencyData], price: &PriceConfig) -> Result<Resolved<'a>, FetchError> {
    let base = currency(all, &price.base).ok_or_else(|| FetchError::PairNotFound {
        provider: PROVIDER,
        base: price.base.clone(),
        quote: price.quote.clone(),
    })?;

    if let Some(data) = base.quote_by_name(&price.quote) {
        if let Some(p) = data.price.filter(|p| *p > 0.0) {
            return Ok(Resolved {
                price: p,
                quote: Some(data),
                currency: base,
            });
        }
    }

    debug!(
        base = %price.base,
        quote = %price.quote,
        quote_override = price.quote_override.as_deref().unwrap_or(""),
        "Quote/Base rate not found directly, trying conversion"
    );
    currency(all, &price.quote)
        .and_then(|quote| convert(base, quote))
        .ok_or_else(|| FetchError::ConversionNotFound {
            provider: PROVIDER,
            base: price.base.clone(),
            quote: price.quote.clone(),
        })
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            warn!(
                last_updated_time = raw,
                error = %e,
                "cannot parse fetched last_updated time as RFC3339"
            );
            None
        }
    }
}

#[async_trait]
impl PriceSource for CoinMarketCap {
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
            request = request.header("X-CMC_PRO_API_KEY", key);
        }
        let listing: Listing = get_json(request, PROVIDER).await?;
        let all = currencies(&listing.data);

        let resolved = resolve(&all, price)?;
        let now = self.clock.now();
        let observed_at = parse_timestamp(resolved.quote.and_then(|q| q.last_updated.as_deref()))
            .or_else(|| parse_timestamp(resolved.currency.last_updated.as_deref()))
            .unwrap_or(now);
        finish(PROVIDER, price, resolved.price, observed_at, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::FixedClock;
    use crate::sources::testing::{descriptor, price};
    use crate::types::ProviderKind;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NOW: i64 = 1_800_000_000;

    async fn serve(body: Value) -> (MockServer, SourceDescriptor) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/cryptocurrency/listings/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        let url = format!("{}/v1/cryptocurrency/listings/latest", server.uri());
        (server, descriptor("coinmarketcap", url, ProviderKind::Coinmarketcap))
    }

    fn adapter() -> CoinMarketCap {
        CoinMarketCap::new(reqwest::Client::new(), Arc::new(FixedClock::at(NOW)), None)
    }

    fn listing() -> Value {
        json!({
            "data": [
                {
                    "name": "Bitcoin", "symbol": "BTC", "slug": "bitcoin",
                    "last_updated": "2023-11-14T22:00:00Z",
                    "quote": {
                        "USD": {"price": 50000.0, "last_updated": "2023-11-14T22:13:20Z"},
                        "EUR": {"price": 40000.0, "last_updated": "2023-11-14T22:13:20Z"}
                    }
                },
                {
                    "name": "Ethereum", "symbol": "ETH", "slug": "ethereum",
                    "quote": {"USD": {"price": 2500.0, "last_updated": "bad"}}
                },
                {
                    "name": "Tether Gold", "symbol": "XAUT", "slug": "tether-gold",
                    "quote": {"BTC": {"price": 0.25}}
                },
                {
                    "name": "Island", "symbol": "ISL", "slug": "island",
                    "quote": {"JPY": {"price": 3.0}}
                }
            ]
        })
    }

    #[tokio::test]
    async fn direct_match_by_symbol_slug_or_name() {
        let (_server, source) = serve(listing()).await;
        for base in ["BTC", "bitcoin", "BITCOIN"] {
            let info = adapter()
                .fetch(&price("coinmarketcap", base, "usd"), &source)
                .await
                .unwrap();
            assert_eq!(info.price, 50000.0);
            assert_eq!(info.last_updated_real.timestamp(), 1_700_000_000);
        }
    }

    #[tokio::test]
    async fn cross_conversion_through_common_quote() {
        let (_server, source) = serve(listing()).await;
        let info = adapter()
            .fetch(&price("coinmarketcap", "BTC", "ETH"), &source)
            .await
            .unwrap();
        assert_eq!(info.price, 20.0);
    }

    #[tokio::test]
    async fn inverse_conversion() {
        let (_server, source) = serve(listing()).await;
        let info = adapter()
            .fetch(&price("coinmarketcap", "BTC", "XAUT"), &source)
            .await
            .unwrap();
        assert_eq!(info.price, 4.0);
        // no timestamp anywhere on the path, so the clock stands in
        assert_eq!(info.last_updated_real.timestamp(), NOW);
    }

    #[tokio::test]
    async fn unreachable_pair_fails_without_looping() {
        let (_server, source) = serve(listing()).await;
        let err = adapter()
            .fetch(&price("coinmarketcap", "ISL", "XAUT"), &source)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ConversionNotFound { .. }));

        let err = adapter()
            .fetch(&price("coinmarketcap", "DOGE", "USD"), &source)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::PairNotFound { .. }));
    }

    #[tokio::test]
    async fn bad_timestamp_falls_back_to_clock() {
        let (_server, source) = serve(listing()).await;
        let info = adapter()
            .fetch(&price("coinmarketcap", "ETH", "USD"), &source)
            .await
            .unwrap();
        assert_eq!(info.price, 2500.0);
        assert_eq!(info.last_updated_real.timestamp(), NOW);
    }

    #[tokio::test]
    async fn data_keyed_by_id_is_accepted() {
        let (_server, source) = serve(json!({
            "data": {
                "1": {"name": "Bitcoin", "symbol": "BTC", "slug": "bitcoin",
                      "quote": {"USD": {"price": 50000.0}}},
                "1027": [{"name": "Ethereum", "symbol": "ETH", "slug": "ethereum",
                          "quote": {"USD": {"price": 2500.0}}}]
            }
        }))
        .await;
        let info = adapter()
            .fetch(&price("coinmarketcap", "ethereum", "USD"), &source)
            .await
            .unwrap();
        assert_eq!(info.price, 2500.0);
    }

    #[tokio::test]
    async fn zero_price_is_an_error() {
        let (_server, source) = serve(json!({
            "data": [{"name": "Dead", "symbol": "DED", "slug": "dead",
                      "quote": {"USD": {"price": 0.0}}}]
        }))
        .await;
        let err = adapter()
            .fetch(&price("coinmarketcap", "DED", "USD"), &source)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ConversionNotFound { .. }));
    }

    #[tokio::test]
    async fn zero_direct_quote_falls_back_to_cross_conversion() {
        let (_server, source) = serve(json!({
            "data": [
                {"name": "Bitcoin", "symbol": "BTC", "slug": "bitcoin",
                 "quote": {"USD": {"price": 50000.0}, "ETH": {"price": 0.0}}},
                {"name": "Ethereum", "symbol": "ETH", "slug": "ethereum",
                 "quote": {"USD": {"price": 2500.0}}}
            ]
        }))
        .await;
        let info = adapter()
            .fetch(&price("coinmarketcap", "BTC", "ETH"), &source)
            .await
            .unwrap();
        assert_eq!(info.price, 20.0);
    }

    #[tokio::test]
    async fn sends_api_key_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("X-CMC_PRO_API_KEY", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing()))
            .expect(1)
            .mount(&server)
            .await;
        let source = descriptor("cmc", server.uri(), ProviderKind::Coinmarketcap);
        let cmc = CoinMarketCap::new(
            reqwest::Client::new(),
            Arc::new(FixedClock::at(NOW)),
            Some("k".into()),
        );
        let info = cmc.fetch(&price("cmc", "BTC", "EUR"), &source).await.unwrap();
        assert_eq!(info.price, 40000.0);
    }
}
