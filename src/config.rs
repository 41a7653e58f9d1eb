use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;

use crate::pricing::{ModelPricing, Pricing};

/// Embedded template written by `tollgate init`.
pub const DEFAULT_TEMPLATE: &str = include_str!("default.toml");

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TARGET: &str = "https://api.anthropic.com";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub models: HashMap<String, ModelConfig>,
    pub fallback: Option<PricingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub port: u16,
    pub target: String,
    /// Duration string: "300ms", "90s", "5m", "1h30m".
    pub timeout: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            target: DEFAULT_TARGET.to_string(),
            timeout: "5m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub aliases: Vec<String>,
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub cache_write_per_mtok: f64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub cache_write_per_mtok: f64,
}

impl Config {
    /// Read config from `path`; with no path, search `./tollgate.toml` then
    /// the per-user config directory. No file at all means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => discover(),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let data = fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut cfg: Config = toml::from_str(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;

        if cfg.proxy.port == 0 {
            cfg.proxy.port = DEFAULT_PORT;
        }
        if cfg.proxy.target.is_empty() {
            cfg.proxy.target = DEFAULT_TARGET.to_string();
        }
        if cfg.proxy.timeout.is_empty() {
            cfg.proxy.timeout = "5m".to_string();
        }
        Ok(cfg)
    }

    /// Upstream request timeout; unparsable values fall back to 5 minutes.
    pub fn proxy_timeout(&self) -> Duration {
        parse_duration(&self.proxy.timeout).unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Pricing override in the shape `PricingTable::apply` expects, or
    /// `None` when the file did not touch pricing.
    pub fn pricing_overrides(&self) -> (Option<HashMap<String, ModelPricing>>, Option<Pricing>) {
        let models = if self.models.is_empty() {
            None
        } else {
            Some(
                self.models
                    .iter()
                    .map(|(name, mc)| {
                        (
                            name.clone(),
                            ModelPricing {
                                aliases: mc.aliases.clone(),
                                pricing: Pricing {
                                    input_per_mtok: mc.input_per_mtok,
                                    output_per_mtok: mc.output_per_mtok,
                                    cache_read_per_mtok: mc.cache_read_per_mtok,
                                    cache_write_per_mtok: mc.cache_write_per_mtok,
                                },
                            },
                        )
                    })
                    .collect(),
            )
        };
        let fallback = self.fallback.map(|f| Pricing {
            input_per_mtok: f.input_per_mtok,
            output_per_mtok: f.output_per_mtok,
            cache_read_per_mtok: f.cache_read_per_mtok,
            cache_write_per_mtok: f.cache_write_per_mtok,
        });
        (models, fallback)
    }
}

fn discover() -> Option<PathBuf> {
    let local = PathBuf::from("tollgate.toml");
    if local.is_file() {
        return Some(local);
    }

    let dirs = ProjectDirs::from("", "", "tollgate")?;
    let user = dirs.config_dir().join("config.toml");
    user.is_file().then_some(user)
}

/// Parse a Go-style duration string: one or more `<number><unit>` segments
/// with units `ms`, `s`, `m`, `h`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let (unit_len, unit) = if rest.starts_with("ms") {
            (2, Duration::from_millis(1))
        } else if rest.starts_with('s') {
            (1, Duration::from_secs(1))
        } else if rest.starts_with('m') {
            (1, Duration::from_secs(60))
        } else if rest.starts_with('h') {
            (1, Duration::from_secs(3600))
        } else {
            return None;
        };
        rest = &rest[unit_len..];
        total += unit * value as u32;
    }
    Some(total)
}
