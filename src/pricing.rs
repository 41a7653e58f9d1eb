use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-million-token rates for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub cache_write_per_mtok: f64,
}

impl Pricing {
    const fn new(input: f64, output: f64, cache_read: f64, cache_write: f64) -> Self {
        Self {
            input_per_mtok: input,
            output_per_mtok: output,
            cache_read_per_mtok: cache_read,
            cache_write_per_mtok: cache_write,
        }
    }
}

/// External representation of one model's pricing, as handed over by the
/// config loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub aliases: Vec<String>,
    pub pricing: Pricing,
}

struct Tables {
    models: HashMap<String, Pricing>,
    aliases: HashMap<String, String>,
    fallback: Pricing,
}

/// Model → rate resolver. Built with Claude-family defaults, optionally
/// overwritten once at startup via [`PricingTable::apply`]; read concurrently
/// by every request handler afterwards.
pub struct PricingTable {
    inner: RwLock<Tables>,
}

const SONNET_TIER: Pricing = Pricing::new(3.00, 15.00, 0.30, 3.75);
const OPUS_TIER: Pricing = Pricing::new(15.00, 75.00, 1.50, 18.75);
const HAIKU_TIER: Pricing = Pricing::new(0.80, 4.00, 0.08, 1.00);

const BUILTIN_MODELS: &[(&str, &str, Pricing)] = &[
    ("claude-sonnet-4-20250514", "claude-sonnet-4", SONNET_TIER),
    ("claude-opus-4-20250514", "claude-opus-4", OPUS_TIER),
    ("claude-3-7-sonnet-20250219", "claude-3-7-sonnet", SONNET_TIER),
    ("claude-3-5-sonnet-20241022", "claude-3-5-sonnet", SONNET_TIER),
    ("claude-3-5-haiku-20241022", "claude-3-5-haiku", HAIKU_TIER),
    ("claude-3-opus-20240229", "claude-3-opus", OPUS_TIER),
];

impl Default for PricingTable {
    fn default() -> Self {
        let mut models = HashMap::with_capacity(BUILTIN_MODELS.len());
        let mut aliases = HashMap::with_capacity(BUILTIN_MODELS.len());
        for (canonical, alias, pricing) in BUILTIN_MODELS {
            models.insert(canonical.to_string(), *pricing);
            aliases.insert(alias.to_string(), canonical.to_string());
        }
        Self {
            inner: RwLock::new(Tables {
                models,
                aliases,
                fallback: SONNET_TIER,
            }),
        }
    }
}

impl PricingTable {
    /// Replace the canonical and alias tables from config. `None` keeps the
    /// built-ins for that part. The alias table is rebuilt only when a model
    /// table is supplied.
    pub fn apply(&self, models: Option<HashMap<String, ModelPricing>>, fallback: Option<Pricing>) {
        let mut tables = self.inner.write().expect("pricing table poisoned");

        if let Some(models) = models {
            let mut canonical = HashMap::with_capacity(models.len());
            let mut aliases = HashMap::new();
            for (name, entry) in models {
                for alias in &entry.aliases {
                    aliases.insert(alias.clone(), name.clone());
                }
                canonical.insert(name, entry.pricing);
            }
            tables.models = canonical;
            tables.aliases = aliases;
        }
        if let Some(fallback) = fallback {
            tables.fallback = fallback;
        }
    }

    /// Resolve a model string to its rates. Total: exact canonical match,
    /// then exact alias, then longest alias prefix, then the fallback entry.
    pub fn lookup(&self, model: &str) -> Pricing {
        let tables = self.inner.read().expect("pricing table poisoned");

        if let Some(p) = tables.models.get(model) {
            return *p;
        }
        if let Some(canonical) = tables.aliases.get(model) {
            if let Some(p) = tables.models.get(canonical) {
                return *p;
            }
        }

        // Alias maps are unordered; picking the longest matching prefix
        // keeps resolution deterministic when aliases nest.
        let mut candidates: Vec<(&String, &String)> = tables
            .aliases
            .iter()
            .filter(|(alias, _)| model.starts_with(alias.as_str()))
            .collect();
        if candidates.len() > 1 {
            candidates.sort_by_key(|(alias, _)| std::cmp::Reverse(alias.len()));
            debug!(
                model,
                matched = %candidates[0].0,
                runners_up = candidates.len() - 1,
                "multiple alias prefixes matched"
            );
        }
        if let Some((_, canonical)) = candidates.first() {
            if let Some(p) = tables.models.get(canonical.as_str()) {
                return *p;
            }
        }

        tables.fallback
    }

    /// Cost of one exchange in dollars.
    pub fn cost(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cache_read: u64,
        cache_write: u64,
    ) -> f64 {
        let p = self.lookup(model);
        (input_tokens as f64 * p.input_per_mtok
            + output_tokens as f64 * p.output_per_mtok
            + cache_read as f64 * p.cache_read_per_mtok
            + cache_write as f64 * p.cache_write_per_mtok)
            / 1_000_000.0
    }
}
