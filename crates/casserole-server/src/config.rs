//! CLI flags, config-file/env layering, and byte-quantity parsing.
//!
//! One field per entry in spec.md §6's configuration table, exactly the
//! flag-per-config-field shape of the original `cmd/root.go`. Values load
//! through three layers, lowest precedence first: built-in defaults, an
//! optional `casserole.toml`, `CASSEROLE_*` environment variables, then
//! explicit CLI flags win over all of them.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line flags. Every field besides `config` is optional so an
/// unset flag falls through to the file/env/default layers in [`Settings::load`].
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "casserole", version, about = "Clustered, read-only caching reverse proxy")]
pub struct Cli {
    /// Path to a TOML config file. Defaults to `./casserole.toml` if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Client-facing listen address.
    #[arg(long, env = "CASSEROLE_ADDRESS")]
    pub address: Option<String>,

    /// Whether to persist blocks to disk at all.
    #[arg(long, env = "CASSEROLE_DISK_CACHE_ENABLED")]
    pub disk_cache_enabled: Option<bool>,

    /// Directory blocks and the timestamp database live under.
    #[arg(long, env = "CASSEROLE_DISK_CACHE_DIR")]
    pub disk_cache_dir: Option<PathBuf>,

    /// Disk footprint that triggers eviction, e.g. `1G`.
    #[arg(long, env = "CASSEROLE_MAX_DISK_USAGE")]
    pub max_disk_usage: Option<String>,

    /// Disk footprint eviction runs down to, e.g. `800M`.
    #[arg(long, env = "CASSEROLE_CLEANED_DISK_USAGE")]
    pub cleaned_disk_usage: Option<String>,

    /// In-memory block cache budget, e.g. `100M`.
    #[arg(long, env = "CASSEROLE_MAX_MEMORY_USAGE")]
    pub max_memory_usage: Option<String>,

    /// Root URL of the mirrored origin.
    #[arg(long, env = "CASSEROLE_MIRROR_URL")]
    pub mirror_url: Option<String>,

    /// This node's own URL, as advertised to peers.
    #[arg(long, env = "CASSEROLE_PEERING_ADDRESS")]
    pub peering_address: Option<String>,

    /// Coordination KV endpoints. Empty means run single-node with an
    /// in-process coordination store instead of etcd.
    #[arg(long = "etcd")]
    pub etcd: Vec<String>,

    /// Regexes; URLs matching any of them are never cached.
    #[arg(long = "passthrough")]
    pub passthrough: Vec<String>,
}

/// Fully resolved configuration, after layering and byte-quantity parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    pub address: String,
    pub disk_cache_enabled: bool,
    pub disk_cache_dir: PathBuf,
    pub max_disk_usage: String,
    pub cleaned_disk_usage: String,
    pub max_memory_usage: String,
    pub mirror_url: String,
    pub peering_address: String,
    #[serde(default)]
    pub etcd: Vec<String>,
    #[serde(default)]
    pub passthrough: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
            disk_cache_enabled: true,
            disk_cache_dir: PathBuf::from("./data"),
            max_disk_usage: "1G".to_string(),
            cleaned_disk_usage: "800M".to_string(),
            max_memory_usage: "100M".to_string(),
            mirror_url: "http://localhost:9000".to_string(),
            peering_address: "http://localhost:8000".to_string(),
            etcd: Vec::new(),
            passthrough: Vec::new(),
        }
    }
}

impl Settings {
    /// Layers defaults, an optional TOML file, `CASSEROLE_*` env vars, and
    /// finally explicit CLI flags (highest precedence) into one [`Settings`].
    pub fn load(cli: Cli) -> Result<Self> {
        let defaults = Settings::default();

        let mut builder = config::Config::builder()
            .set_default("address", defaults.address.clone())?
            .set_default("disk-cache-enabled", defaults.disk_cache_enabled)?
            .set_default("disk-cache-dir", defaults.disk_cache_dir.display().to_string())?
            .set_default("max-disk-usage", defaults.max_disk_usage.clone())?
            .set_default("cleaned-disk-usage", defaults.cleaned_disk_usage.clone())?
            .set_default("max-memory-usage", defaults.max_memory_usage.clone())?
            .set_default("mirror-url", defaults.mirror_url.clone())?
            .set_default("peering-address", defaults.peering_address.clone())?
            .set_default("etcd", Vec::<String>::new())?
            .set_default("passthrough", Vec::<String>::new())?;

        builder = match &cli.config {
            Some(path) => builder.add_source(config::File::from(path.as_path()).required(true)),
            None => builder.add_source(config::File::with_name("casserole").required(false)),
        };
        builder = builder.add_source(
            config::Environment::with_prefix("CASSEROLE").separator("_").try_parsing(true),
        );

        let built = builder.build().context("loading configuration")?;
        let mut settings: Settings = built.try_deserialize().context("parsing configuration")?;

        if let Some(v) = cli.address {
            settings.address = v;
        }
        if let Some(v) = cli.disk_cache_enabled {
            settings.disk_cache_enabled = v;
        }
        if let Some(v) = cli.disk_cache_dir {
            settings.disk_cache_dir = v;
        }
        if let Some(v) = cli.max_disk_usage {
            settings.max_disk_usage = v;
        }
        if let Some(v) = cli.cleaned_disk_usage {
            settings.cleaned_disk_usage = v;
        }
        if let Some(v) = cli.max_memory_usage {
            settings.max_memory_usage = v;
        }
        if let Some(v) = cli.mirror_url {
            settings.mirror_url = v;
        }
        if let Some(v) = cli.peering_address {
            settings.peering_address = v;
        }
        if !cli.etcd.is_empty() {
            settings.etcd = cli.etcd;
        }
        if !cli.passthrough.is_empty() {
            settings.passthrough = cli.passthrough;
        }

        Ok(settings)
    }

    pub fn max_disk_usage_bytes(&self) -> Result<u64> {
        parse_byte_size(&self.max_disk_usage)
    }

    pub fn cleaned_disk_usage_bytes(&self) -> Result<u64> {
        parse_byte_size(&self.cleaned_disk_usage)
    }

    pub fn max_memory_usage_bytes(&self) -> Result<u64> {
        parse_byte_size(&self.max_memory_usage)
    }
}

/// Parses a byte quantity with an optional binary-unit suffix (`K`, `M`,
/// `G`, `T`; case-insensitive, trailing `B` tolerated), the Rust analogue
/// of the original's `bytefmt.ToBytes`. A bare number is bytes.
pub fn parse_byte_size(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("empty byte quantity"));
    }

    let mut end = trimmed.len();
    for (i, c) in trimmed.char_indices() {
        if c.is_ascii_digit() || c == '.' {
            end = i + c.len_utf8();
        } else {
            break;
        }
    }
    let (number, unit) = trimmed.split_at(end);
    let number: f64 =
        number.parse().map_err(|_| anyhow!("invalid byte quantity: {raw}"))?;

    let unit = unit.trim().trim_end_matches(['b', 'B']).to_ascii_uppercase();
    let multiplier: u64 = match unit.as_str() {
        "" => 1,
        "K" => 1024,
        "M" => 1024 * 1024,
        "G" => 1024 * 1024 * 1024,
        "T" => 1024 * 1024 * 1024 * 1024,
        other => return Err(anyhow!("unknown byte quantity unit {other:?} in {raw}")),
    };

    Ok((number * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse_byte_size("1024").unwrap(), 1024);
    }

    #[test]
    fn parses_binary_suffixes() {
        assert_eq!(parse_byte_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size("800M").unwrap(), 800 * 1024 * 1024);
        assert_eq!(parse_byte_size("100M").unwrap(), 100 * 1024 * 1024);
    }

    #[test]
    fn tolerates_trailing_b() {
        assert_eq!(parse_byte_size("1GB").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_byte_size("1X").is_err());
    }

    #[test]
    fn defaults_match_spec_table() {
        let s = Settings::default();
        assert_eq!(s.max_disk_usage_bytes().unwrap(), 1024 * 1024 * 1024);
        assert_eq!(s.cleaned_disk_usage_bytes().unwrap(), 800 * 1024 * 1024);
        assert_eq!(s.max_memory_usage_bytes().unwrap(), 100 * 1024 * 1024);
    }
}
