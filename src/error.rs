use thiserror::Error;

/// Errors raised while building or querying the source registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("source already exists: {0}")]
    DuplicateSource(String),

    #[error("invalid source config for {source_name}: {field} must be greater than zero")]
    InvalidInterval {
        source_name: String,
        field: &'static str,
    },

    #[error("price source not found: {0}")]
    SourceNotFound(String),
}

/// Transient failure of a single real-price fetch. Never escapes a poller.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("{provider} parse failed: {reason}")]
    Parse {
        provider: &'static str,
        reason: String,
    },

    #[error("{provider}: no price for {base}/{quote} in response")]
    PairNotFound {
        provider: &'static str,
        base: String,
        quote: String,
    },

    #[error("{provider}: no conversion path from {base} to {quote}")]
    ConversionNotFound {
        provider: &'static str,
        base: String,
        quote: String,
    },

    #[error("{provider}: non-positive price {price} for {base}/{quote}")]
    NonPositive {
        provider: &'static str,
        base: String,
        quote: String,
        price: f64,
    },

    #[error("source {0} has no price schema; nothing to fetch")]
    Inert(String),
}

impl FetchError {
    pub fn parse(provider: &'static str, reason: impl ToString) -> Self {
        FetchError::Parse {
            provider,
            reason: reason.to_string(),
        }
    }
}
