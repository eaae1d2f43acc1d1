//! Service configuration for libris-agg
//!
//! `ServiceConfig` is read from TOML (`--config` or
//! `~/.config/libris/libris.toml`); every section has defaults so an absent
//! file yields a runnable service. Provider credentials are resolved with
//! Database -> ENV -> TOML priority.

use crate::types::ProviderId;
use libris_common::config::{default_config_file, load_toml_config, LoggingConfig};
use libris_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Module name used for the default config file lookup
pub const MODULE_NAME: &str = "libris";

pub const CATALOG_TOKEN_ENV: &str = "LIBRIS_CATALOG_TOKEN";
pub const PUBLISHER_API_KEY_ENV: &str = "LIBRIS_PUBLISHER_API_KEY";

/// Settings-table keys for persisted credentials
pub const CATALOG_TOKEN_SETTING: &str = "catalog_token";
pub const PUBLISHER_API_KEY_SETTING: &str = "publisher_api_key";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub root_folder: Option<PathBuf>,
    pub bind_address: String,
    pub logging: LoggingConfig,
    pub cache: CacheConfig,
    pub fanout: FanoutConfig,
    pub breaker: BreakerConfig,
    pub providers: ProvidersConfig,
    pub import: ImportConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            bind_address: "127.0.0.1:5780".to_string(),
            logging: LoggingConfig::default(),
            cache: CacheConfig::default(),
            fanout: FanoutConfig::default(),
            breaker: BreakerConfig::default(),
            providers: ProvidersConfig::default(),
            import: ImportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Fast-tier time to live
    pub ttl_secs: u64,
    /// Fast-tier capacity; oldest entries are evicted first
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FanoutConfig {
    /// Upper bound on the whole fanout
    pub max_lookup_latency_ms: u64,
    /// Added to the slowest provider timeout
    pub safety_margin_ms: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_lookup_latency_ms: 8_000,
            safety_margin_ms: 500,
        }
    }
}

impl FanoutConfig {
    /// `min(max_lookup_latency, max(provider timeouts) + safety_margin)`
    pub fn aggregate_deadline(&self, provider_timeouts: impl IntoIterator<Item = Duration>) -> Duration {
        let slowest = provider_timeouts.into_iter().max().unwrap_or_default();
        let ceiling = Duration::from_millis(self.max_lookup_latency_ms);
        (slowest + Duration::from_millis(self.safety_margin_ms)).min(ceiling)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting a probe
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 30,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Per-provider knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Outbound quota
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// Weight of this provider's rating in the merged average
    pub trust_weight: Option<f64>,
    /// Results requested per search call
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    /// Bearer token (catalog)
    pub token: Option<String>,
    /// API key (publisher)
    pub api_key: Option<String>,
    /// Chapter service base URL (catalog)
    pub chapters_url: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_search_limit() -> usize {
    5
}

impl ProviderConfig {
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            enabled: true,
            base_url: base_url.to_string(),
            timeout_ms: default_timeout_ms(),
            requests_per_second: default_requests_per_second(),
            trust_weight: None,
            search_limit: default_search_limit(),
            token: None,
            api_key: None,
            chapters_url: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProvidersConfig {
    pub catalog: ProviderConfig,
    pub storefront: ProviderConfig,
    pub ratings: ProviderConfig,
    pub publisher: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        let mut catalog = ProviderConfig::with_base_url("https://api.audible.com/1.0");
        catalog.chapters_url = Some("https://api.audnex.us".to_string());

        let mut ratings = ProviderConfig::with_base_url("https://www.goodreads.com");
        ratings.timeout_ms = 8_000;
        ratings.requests_per_second = 1;

        let mut publisher = ProviderConfig::with_base_url(
            "https://api.penguinrandomhouse.com/resources/v2/title/domains/PRH.US",
        );
        publisher.timeout_ms = 10_000;

        Self {
            catalog,
            storefront: ProviderConfig::with_base_url("https://itunes.apple.com"),
            ratings,
            publisher,
        }
    }
}

impl ProvidersConfig {
    pub fn get(&self, provider: ProviderId) -> &ProviderConfig {
        match provider {
            ProviderId::Catalog => &self.catalog,
            ProviderId::Storefront => &self.storefront,
            ProviderId::Ratings => &self.ratings,
            ProviderId::Publisher => &self.publisher,
        }
    }

    pub fn get_mut(&mut self, provider: ProviderId) -> &mut ProviderConfig {
        match provider {
            ProviderId::Catalog => &mut self.catalog,
            ProviderId::Storefront => &mut self.storefront,
            ProviderId::Ratings => &mut self.ratings,
            ProviderId::Publisher => &mut self.publisher,
        }
    }

    /// Effective trust weight (configured or provider default)
    pub fn trust_weight(&self, provider: ProviderId) -> f64 {
        self.get(provider)
            .trust_weight
            .unwrap_or_else(|| provider.default_trust_weight())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImportConfig {
    /// Pagination cap per list
    pub scrape_limit_pages: usize,
    /// Minimum spacing between page requests to one list source
    pub min_interval_ms: u64,
    /// Per-page request timeout
    pub page_timeout_ms: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            scrape_limit_pages: 100,
            min_interval_ms: 1_500,
            page_timeout_ms: 15_000,
        }
    }
}

impl ImportConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }
}

impl ServiceConfig {
    /// Load from an explicit path, else the per-user default file, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_file(MODULE_NAME),
        };

        let config = match config_path {
            Some(p) => {
                info!(path = %p.display(), "Loading service config");
                load_toml_config::<ServiceConfig>(&p)?
            }
            None => {
                info!("No config file found, using defaults");
                ServiceConfig::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.import.scrape_limit_pages == 0 {
            return Err(Error::Config(
                "import.scrape_limit_pages must be at least 1".to_string(),
            ));
        }
        for provider in ProviderId::ALL {
            let pc = self.providers.get(provider);
            if pc.requests_per_second == 0 {
                return Err(Error::Config(format!(
                    "providers.{}.requests_per_second must be at least 1",
                    provider
                )));
            }
            if pc.timeout_ms == 0 {
                return Err(Error::Config(format!(
                    "providers.{}.timeout_ms must be positive",
                    provider
                )));
            }
        }
        Ok(())
    }

    /// Fill provider credentials from Database -> ENV -> TOML
    pub async fn resolve_credentials(&mut self, db: &Pool<Sqlite>) -> Result<()> {
        let token = resolve_credential(
            db,
            CATALOG_TOKEN_SETTING,
            CATALOG_TOKEN_ENV,
            self.providers.catalog.token.as_deref(),
        )
        .await?;
        self.providers.catalog.token = token;

        let api_key = resolve_credential(
            db,
            PUBLISHER_API_KEY_SETTING,
            PUBLISHER_API_KEY_ENV,
            self.providers.publisher.api_key.as_deref(),
        )
        .await?;
        self.providers.publisher.api_key = api_key;
        Ok(())
    }
}

/// Resolve one credential
///
/// **Priority:** Database -> ENV -> TOML. A credential that is missing
/// everywhere is not an error; the adapter decides what that means.
pub async fn resolve_credential(
    db: &Pool<Sqlite>,
    setting_key: &str,
    env_var: &str,
    toml_value: Option<&str>,
) -> Result<Option<String>> {
    let db_value = crate::db::settings::get_setting(db, setting_key)
        .await?
        .filter(|v| is_valid_key(v));
    let env_value = std::env::var(env_var).ok().filter(|v| is_valid_key(v));
    let toml_value = toml_value.filter(|v| is_valid_key(v)).map(str::to_string);

    let sources: Vec<&str> = [
        db_value.as_ref().map(|_| "database"),
        env_value.as_ref().map(|_| "environment"),
        toml_value.as_ref().map(|_| "TOML"),
    ]
    .into_iter()
    .flatten()
    .collect();

    if sources.len() > 1 {
        warn!(
            setting = setting_key,
            "Credential found in multiple sources: {}. Using {} (highest priority).",
            sources.join(", "),
            sources[0]
        );
    }

    if let Some(source) = sources.first() {
        info!(setting = setting_key, source = source, "Credential loaded");
    }

    Ok(db_value.or(env_value).or(toml_value))
}

/// Non-empty, non-whitespace
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.ttl(), Duration::from_secs(300));
        assert_eq!(config.import.scrape_limit_pages, 100);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml_str = r#"
            bind_address = "0.0.0.0:9000"

            [cache]
            ttl_secs = 60

            [providers.publisher]
            base_url = "http://localhost:1234"
            api_key = "abc"
        "#;
        let config: ServiceConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:9000");
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.max_entries, 10_000);
        assert_eq!(config.providers.publisher.base_url, "http://localhost:1234");
        assert_eq!(config.providers.publisher.api_key.as_deref(), Some("abc"));
        assert!(config.providers.publisher.enabled);
        assert_eq!(config.providers.publisher.timeout_ms, 5_000);
        assert_eq!(config.providers.ratings.base_url, "https://www.goodreads.com");
    }

    #[test]
    fn test_aggregate_deadline_formula() {
        let fanout = FanoutConfig {
            max_lookup_latency_ms: 8_000,
            safety_margin_ms: 500,
        };
        let deadline = fanout.aggregate_deadline([
            Duration::from_millis(2_000),
            Duration::from_millis(5_000),
        ]);
        assert_eq!(deadline, Duration::from_millis(5_500));

        let capped = fanout.aggregate_deadline([Duration::from_millis(10_000)]);
        assert_eq!(capped, Duration::from_millis(8_000));
    }

    #[test]
    fn test_validate_rejects_zero_quota() {
        let mut config = ServiceConfig::default();
        config.providers.ratings.requests_per_second = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_trust_weight_falls_back_to_provider_default() {
        let mut providers = ProvidersConfig::default();
        assert_eq!(providers.trust_weight(ProviderId::Ratings), 1.0);
        providers.storefront.trust_weight = Some(0.9);
        assert_eq!(providers.trust_weight(ProviderId::Storefront), 0.9);
    }

    #[test]
    fn test_is_valid_key() {
        assert!(is_valid_key("abc"));
        assert!(!is_valid_key("   "));
        assert!(!is_valid_key(""));
    }
}
