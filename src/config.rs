// src/config.rs

//! Configuration loading.
//!
//! The config file is TOML with a `[options]` table, optional `[proxy]`
//! table, and one `[[sites]]` table per monitored site. Unknown keys are
//! rejected at parse time rather than silently accepted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::SiteConfig;

/// Global options bundle shared by every run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct GlobalOptions {
    /// Process-wide bound on in-flight HTTP requests
    pub max_concurrent_fetches: usize,

    /// Per-request connect+read timeout
    pub fetch_timeout_secs: u64,

    /// Minimum spacing between request starts against one host, in ms
    pub per_host_delay_ms: u64,

    /// Fingerprinter batch size; progress is reported per batch
    pub batch_size: usize,

    /// Baselines retained per site (the initial baseline is always kept)
    pub retention_count: usize,

    /// Root directory for run output (reports, state snapshots)
    pub output_root: String,

    /// Root directory for baseline history and event logs
    pub baseline_root: String,

    /// Whole-run deadline per site
    pub run_deadline_secs: u64,

    /// How long a caller waits on a busy site lock before giving up
    pub lock_wait_secs: u64,

    /// Retry attempts for transient fetch failures
    pub retry_attempts: u32,

    /// Base delay for exponential retry backoff, in ms
    pub retry_base_ms: u64,

    /// Maximum response body size accepted by the fetcher
    pub max_body_bytes: usize,

    pub user_agent: String,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 20,
            fetch_timeout_secs: 15,
            per_host_delay_ms: 100,
            batch_size: 20,
            retention_count: 30,
            output_root: "output".to_string(),
            baseline_root: "baselines".to_string(),
            run_deadline_secs: 1800,
            lock_wait_secs: 60,
            retry_attempts: 3,
            retry_base_ms: 1000,
            max_body_bytes: 10 * 1024 * 1024,
            user_agent: concat!("driftwatch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl GlobalOptions {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn per_host_delay(&self) -> Duration {
        Duration::from_millis(self.per_host_delay_ms)
    }
}

/// Supported proxy providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyProvider {
    Tor,
}

/// Optional proxy routing for all fetches.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub provider: ProxyProvider,

    /// SOCKS endpoint, e.g. `socks5h://127.0.0.1:9050`
    #[serde(default = "default_socks_addr")]
    pub socks_addr: String,

    /// Tor control port for identity rotation; rotation is skipped when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_addr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_password: Option<String>,

    /// Request a new identity after this many successful fetches
    #[serde(default = "default_rotate_every")]
    pub rotate_every: usize,

    /// Fall back to a direct connection when the proxy refuses
    #[serde(default)]
    pub allow_direct_fallback: bool,
}

fn default_socks_addr() -> String {
    "socks5h://127.0.0.1:9050".to_string()
}

fn default_rotate_every() -> usize {
    10
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub options: GlobalOptions,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,

    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| AppError::config(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for site in &self.sites {
            if site.id.is_empty() {
                return Err(AppError::config("site with empty id"));
            }
            if !seen.insert(site.id.as_str()) {
                return Err(AppError::config(format!("duplicate site id '{}'", site.id)));
            }
            if site.methods.is_empty() {
                return Err(AppError::config(format!(
                    "site '{}' has no detection methods",
                    site.id
                )));
            }
        }
        if self.options.max_concurrent_fetches == 0 {
            return Err(AppError::config("max_concurrent_fetches must be positive"));
        }
        if self.options.batch_size == 0 {
            return Err(AppError::config("batch_size must be positive"));
        }
        Ok(())
    }

    /// Look up a site by id.
    pub fn site(&self, site_id: &str) -> Result<&SiteConfig> {
        self.sites
            .iter()
            .find(|s| s.id == site_id)
            .ok_or_else(|| AppError::UnknownSite(site_id.to_string()))
    }

    /// All sites with the active flag set.
    pub fn active_sites(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites.iter().filter(|s| s.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [options]
        max_concurrent_fetches = 8
        batch_size = 10

        [[sites]]
        id = "example"
        name = "Example"
        url = "https://example.com"
        methods = ["sitemap", "content"]

        [[sites]]
        id = "docs"
        name = "Docs"
        url = "https://docs.example.com"
        sitemap_url = "https://docs.example.com/sm.xml"
        active = false
    "#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.options.max_concurrent_fetches, 8);
        assert_eq!(config.options.retention_count, 30);
        assert_eq!(config.sites.len(), 2);
        assert_eq!(config.active_sites().count(), 1);
        assert_eq!(config.sites[0].methods.len(), 2);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let raw = r#"
            [options]
            max_concurrent_fetches = 8
            frobnicate = true
        "#;
        assert!(toml::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn test_duplicate_site_ids_rejected() {
        let raw = r#"
            [[sites]]
            id = "a"
            name = "A"
            url = "https://a.example.com"

            [[sites]]
            id = "a"
            name = "A again"
            url = "https://a2.example.com"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_site_lookup() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert!(matches!(
            config.site("nope"),
            Err(AppError::UnknownSite(_))
        ));
        assert!(config.site("example").is_ok());
    }

    #[test]
    fn test_proxy_defaults() {
        let raw = r#"
            [proxy]
            provider = "tor"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.socks_addr, "socks5h://127.0.0.1:9050");
        assert_eq!(proxy.rotate_every, 10);
        assert!(!proxy.allow_direct_fallback);
    }
}
