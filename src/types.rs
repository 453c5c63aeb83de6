use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of a configured price: which source, which pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PriceKey {
    pub source: String,
    pub base: String,
    pub quote: String,
}

impl PriceKey {
    pub fn new(
        source: impl Into<String>,
        base: impl Into<String>,
        quote: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            base: base.into(),
            quote: quote.into(),
        }
    }
}

impl fmt::Display for PriceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.source, self.base, self.quote)
    }
}

/// The currently believed price for one key.
///
/// `last_updated_real` is when the underlying observation was made upstream;
/// `last_updated_wander` is when this value was last written, by a real
/// fetch or by the wander model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceInfo {
    pub price: f64,
    pub last_updated_real: DateTime<Utc>,
    pub last_updated_wander: DateTime<Utc>,
}

impl PriceInfo {
    pub fn real(price: f64, observed_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            price,
            last_updated_real: observed_at,
            last_updated_wander: now,
        }
    }

    /// A price may only be stored when it is finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }
}

/// Which upstream schema a source speaks. Resolved once per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Coingecko,
    Coinmarketcap,
    Bitstamp,
    Template,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Coingecko => "coingecko",
            ProviderKind::Coinmarketcap => "coinmarketcap",
            ProviderKind::Bitstamp => "bitstamp",
            ProviderKind::Template => "template",
        }
    }

    /// Pick a provider from the host part of a source URL.
    pub fn infer(url_template: &str) -> Self {
        let host = url::Url::parse(url_template)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .unwrap_or_default();
        if host.contains("coingecko.com") {
            ProviderKind::Coingecko
        } else if host.contains("coinmarketcap.com") {
            ProviderKind::Coinmarketcap
        } else if host.contains("bitstamp.net") {
            ProviderKind::Bitstamp
        } else {
            ProviderKind::Template
        }
    }
}

/// Immutable description of one upstream endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceDescriptor {
    pub name: String,
    pub url: String,
    pub provider: ProviderKind,
    /// Poll interval in seconds.
    pub sleep_real: u64,
    /// Wander interval in seconds.
    pub sleep_wander: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_key_env_name: Option<String>,
}

impl SourceDescriptor {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_real)
    }

    pub fn wander_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_wander)
    }

    /// Substitute `{base}` and `{quote}` into the URL template.
    pub fn url_for(&self, key: &PriceKey) -> String {
        self.url
            .replace("{base}", &key.base)
            .replace("{quote}", &key.quote)
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{SourceConfig Name:{} URL:{} SleepReal:{}s}}",
            self.name, self.url, self.sleep_real
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_is_inferred_from_host() {
        assert_eq!(
            ProviderKind::infer("https://api.coingecko.com/api/v3/simple/price?ids={base}"),
            ProviderKind::Coingecko
        );
        assert_eq!(
            ProviderKind::infer(
                "https://pro-api.coinmarketcap.com/v1/cryptocurrency/listings/latest"
            ),
            ProviderKind::Coinmarketcap
        );
        assert_eq!(
            ProviderKind::infer("https://www.bitstamp.net/api/v2/ticker/{base}{quote}/"),
            ProviderKind::Bitstamp
        );
        assert_eq!(
            ProviderKind::infer("https://example.com/{base}/{quote}"),
            ProviderKind::Template
        );
        // the path does not count, only the host
        assert_eq!(
            ProviderKind::infer("https://example.com/coingecko.com"),
            ProviderKind::Template
        );
    }

    #[test]
    fn url_template_substitutes_base_and_quote() {
        let source = SourceDescriptor {
            name: "bitstamp".into(),
            url: "https://www.bitstamp.net/api/v2/ticker/{base}{quote}/?pair={base}-{quote}".into(),
            provider: ProviderKind::Bitstamp,
            sleep_real: 10,
            sleep_wander: 1,
            auth_key_env_name: None,
        };
        let key = PriceKey::new("bitstamp", "btc", "usd");
        assert_eq!(
            source.url_for(&key),
            "https://www.bitstamp.net/api/v2/ticker/btcusd/?pair=btc-usd"
        );
    }

    #[test]
    fn source_display() {
        let source = SourceDescriptor {
            name: "NNN".into(),
            url: "https://example.com/path?a=b&x=y".into(),
            provider: ProviderKind::Template,
            sleep_real: 11,
            sleep_wander: 1,
            auth_key_env_name: None,
        };
        assert_eq!(
            source.to_string(),
            "{SourceConfig Name:NNN URL:https://example.com/path?a=b&x=y SleepReal:11s}"
        );
    }

    #[test]
    fn zero_and_nan_prices_are_invalid() {
        let now = Utc::now();
        assert!(PriceInfo::real(1.0, now, now).is_valid());
        assert!(!PriceInfo::real(0.0, now, now).is_valid());
        assert!(!PriceInfo::real(-3.0, now, now).is_valid());
        assert!(!PriceInfo::real(f64::NAN, now, now).is_valid());
        assert!(!PriceInfo::real(f64::INFINITY, now, now).is_valid());
    }
}
