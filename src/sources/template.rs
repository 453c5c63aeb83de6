use super::PriceSource;
use crate::config::PriceConfig;
use crate::error::FetchError;
use crate::types::{PriceInfo, SourceDescriptor};
use async_trait::async_trait;

/// Fallback for sources whose response schema is unknown. It reports itself
/// inert so no poller is started for it, and refuses to produce a price if
/// called anyway.
#[derive(Debug, Default)]
pub struct Template;

impl Template {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PriceSource for Template {
    fn name(&self) -> &str {
        "template"
    }

    fn is_inert(&self) -> bool {
        true
    }

    async fn fetch(
        &self,
        _price: &PriceConfig,
        source: &SourceDescriptor,
    ) -> Result<PriceInfo, FetchError> {
        Err(FetchError::Inert(source.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::testing::{descriptor, price};
    use crate::types::ProviderKind;

    #[tokio::test]
    async fn never_fabricates_a_price() {
        let source = descriptor(
            "custom",
            "https://example.com/{base}/{quote}".into(),
            ProviderKind::Template,
        );
        let adapter = Template::new();
        assert!(adapter.is_inert());
        let err = adapter
            .fetch(&price("custom", "btc", "usd"), &source)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Inert(name) if name == "custom"));
    }
}
