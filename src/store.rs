use crate::config::PriceConfig;
use crate::types::{PriceInfo, PriceKey};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// One row of a snapshot: the configuration that produced it and its
/// current value.
#[derive(Debug, Clone)]
pub struct PriceEntry {
    pub config: Arc<PriceConfig>,
    pub info: PriceInfo,
}

/// Optional equality filters for [`PriceStore::snapshot`]. Base and quote
/// match either the canonical or the override name, ignoring case.
#[derive(Debug, Clone, Default)]
pub struct PriceFilter {
    pub source: Option<String>,
    pub base: Option<String>,
    pub quote: Option<String>,
    pub wander: Option<bool>,
}

impl PriceFilter {
    pub fn matches(&self, price: &PriceConfig) -> bool {
        let name_matches = |wanted: &Option<String>, canonical: &str, over: &Option<String>| {
            match wanted.as_deref().filter(|w| !w.is_empty()) {
                None => true,
                Some(w) => {
                    w.eq_ignore_ascii_case(canonical)
                        || over
                            .as_deref()
                            .map(|o| !o.is_empty() && w.eq_ignore_ascii_case(o))
                            .unwrap_or(false)
                }
            }
        };

        self.source
            .as_deref()
            .filter(|s| !s.is_empty())
            .map_or(true, |s| s == price.source)
            && name_matches(&self.base, &price.base, &price.base_override)
            && name_matches(&self.quote, &price.quote, &price.quote_override)
            && self.wander.map_or(true, |w| w == price.wander)
    }
}

/// Latest price per key, shared between pollers (writers) and readers.
#[derive(Debug, Default)]
pub struct PriceStore {
    prices: RwLock<HashMap<PriceKey, PriceEntry>>,
}

impl PriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional overwrite of the key's entry.
    pub fn upsert(&self, config: &Arc<PriceConfig>, info: PriceInfo) {
        let entry = PriceEntry {
            config: Arc::clone(config),
            info,
        };
        self.prices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.key(), entry);
    }

    /// `None` until the key's first successful write.
    pub fn get(&self, key: &PriceKey) -> Option<PriceInfo> {
        self.prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|entry| entry.info)
    }

    /// Point-in-time copy of every matching entry, in no particular order.
    pub fn snapshot(&self, filter: &PriceFilter) -> Vec<PriceEntry> {
        self.prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| filter.matches(&entry.config))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.prices.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
