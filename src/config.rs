use crate::types::{PriceKey, ProviderKind, SourceDescriptor};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

const MISSING_SECTION: &str = "config file section is missing/empty";
const INVALID_VALUE: &str = "invalid value";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub prices: Vec<PriceConfig>,
}

/// Settings for running the proxy itself.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub log_format: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            env: default_env(),
            listen: default_listen(),
            log_format: String::new(),
            log_level: default_log_level(),
        }
    }
}

fn default_env() -> String {
    "prod".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One upstream endpoint. `{base}` and `{quote}` in the URL are replaced
/// per price at fetch time.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub auth_key_env_name: Option<String>,
    #[serde(alias = "sleepReal")]
    pub sleep_real: u64,
    #[serde(alias = "sleepWander")]
    pub sleep_wander: u64,
}

impl SourceConfig {
    pub fn to_descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            name: self.name.clone(),
            url: self.url.clone(),
            provider: self
                .provider
                .unwrap_or_else(|| ProviderKind::infer(&self.url)),
            sleep_real: self.sleep_real,
            sleep_wander: self.sleep_wander,
            auth_key_env_name: self
                .auth_key_env_name
                .clone()
                .filter(|name| !name.is_empty()),
        }
    }
}

/// One configured price. Identity is `{source, base, quote}`; the rest
/// only changes how the price is computed or presented.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceConfig {
    pub source: String,
    pub base: String,
    #[serde(default)]
    pub base_override: Option<String>,
    pub quote: String,
    #[serde(default)]
    pub quote_override: Option<String>,
    pub factor: f64,
    #[serde(default)]
    pub wander: bool,
}

impl PriceConfig {
    pub fn key(&self) -> PriceKey {
        PriceKey::new(&self.source, &self.base, &self.quote)
    }

    pub fn display_base(&self) -> &str {
        non_empty(&self.base_override).unwrap_or(&self.base)
    }

    pub fn display_quote(&self) -> &str {
        non_empty(&self.quote_override).unwrap_or(&self.quote)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.is_none() {
            anyhow::bail!("{}: server", MISSING_SECTION);
        }

        if self.sources.is_empty() {
            anyhow::bail!("{}: sources", MISSING_SECTION);
        }
        let mut source_names: HashSet<&str> = HashSet::new();
        for source in &self.sources {
            if !source_names.insert(source.name.as_str()) {
                anyhow::bail!("duplicate source name '{}'", source.name);
            }
            if source.sleep_real == 0 {
                anyhow::bail!("{}: sleep_real (source '{}')", INVALID_VALUE, source.name);
            }
            if source.sleep_wander == 0 {
                anyhow::bail!("{}: sleep_wander (source '{}')", INVALID_VALUE, source.name);
            }
            let probe = source.url.replace("{base}", "base").replace("{quote}", "quote");
            url::Url::parse(&probe).with_context(|| {
                format!("{}: url '{}' (source '{}')", INVALID_VALUE, source.url, source.name)
            })?;
        }

        if self.prices.is_empty() {
            anyhow::bail!("{}: prices", MISSING_SECTION);
        }
        let mut keys: HashSet<PriceKey> = HashSet::new();
        for price in &self.prices {
            if !price.factor.is_finite() || price.factor <= 0.0 {
                anyhow::bail!("{}: factor (price {})", INVALID_VALUE, price.key());
            }
            if !source_names.contains(price.source.as_str()) {
                anyhow::bail!("price {} references unknown source '{}'", price.key(), price.source);
            }
            if !keys.insert(price.key()) {
                anyhow::bail!("duplicate price {}", price.key());
            }
        }
        Ok(())
    }

    pub fn server(&self) -> Option<&ServerConfig> {
        self.server.as_ref()
    }

    pub fn descriptors(&self) -> Vec<SourceDescriptor> {
        self.sources.iter().map(SourceConfig::to_descriptor).collect()
    }
}
