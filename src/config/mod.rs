use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL - loaded from env DATABASE_URL
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Per-statement timeout applied to every session.
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint - loaded from env RPC_URL
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Keeper signer - loaded from env PRIVATE_KEY
    #[serde(default)]
    pub private_key: String,
    /// Guided-oracle signer - loaded from env ORACLE_PRIVATE_KEY
    #[serde(default)]
    pub oracle_private_key: String,
    #[serde(default)]
    pub oddyssey_address: String,
    #[serde(default)]
    pub pool_address: String,
    #[serde(default)]
    pub guided_oracle_address: String,
    #[serde(default)]
    pub reputation_address: String,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    /// Gas limit = estimate × (100 + buffer) / 100.
    #[serde(default = "default_gas_buffer_pct")]
    pub gas_buffer_pct: u64,
    /// Event polling interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub gas_ceilings: GasCeilings,
}

/// Gas limit used when estimation reverts, per write type.
#[derive(Debug, Clone, Deserialize)]
pub struct GasCeilings {
    #[serde(default = "default_gas_start_cycle")]
    pub start_cycle: u64,
    #[serde(default = "default_gas_resolve_cycle")]
    pub resolve_cycle: u64,
    #[serde(default = "default_gas_evaluate_slip")]
    pub evaluate_slip: u64,
    #[serde(default = "default_gas_settle_pool")]
    pub settle_pool: u64,
    #[serde(default = "default_gas_place_slip")]
    pub place_slip: u64,
    #[serde(default = "default_gas_create_pool")]
    pub create_pool: u64,
    #[serde(default = "default_gas_claim")]
    pub claim: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Upper bound on one job run; the lock expires after this.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// How far back a dependency's last execution counts.
    #[serde(default = "default_dependency_window")]
    pub dependency_window_secs: u64,
    #[serde(default = "default_dependency_max_wait")]
    pub dependency_max_wait_secs: u64,
    #[serde(default = "default_dependency_poll_ms")]
    pub dependency_poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    /// Max blocks per `eth_getLogs` window.
    #[serde(default = "default_window_blocks")]
    pub window_blocks: u64,
    #[serde(default = "default_fallback_lookback")]
    pub fallback_lookback_blocks: u64,
    /// First block to index when no cursor exists (0 = head minus lookback).
    #[serde(default)]
    pub start_block: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_slip_spacing_ms")]
    pub slip_spacing_ms: u64,
    #[serde(default = "default_batch_spacing_ms")]
    pub batch_spacing_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_open_cycle_secs")]
    pub open_cycle_secs: u64,
    #[serde(default = "default_results_secs")]
    pub results_secs: u64,
    #[serde(default = "default_evaluation_secs")]
    pub evaluation_secs: u64,
    #[serde(default = "default_indexer_fallback_secs")]
    pub indexer_fallback_secs: u64,
    #[serde(default = "default_settlement_fallback_secs")]
    pub settlement_fallback_secs: u64,
    #[serde(default = "default_lock_cleanup_secs")]
    pub lock_cleanup_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_execution_log_retention_days")]
    pub execution_log_retention_days: i64,
    #[serde(default = "default_fixture_retention_days")]
    pub fixture_retention_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Sports API base URL - loaded from env SPORTS_API_URL
    #[serde(default = "default_feed_url")]
    pub base_url: String,
    /// Loaded from env SPORTS_API_TOKEN
    #[serde(default)]
    pub api_token: String,
    /// Minimum spacing between requests to the same endpoint.
    #[serde(default = "default_feed_interval_ms")]
    pub min_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Loaded from env REDIS_URL; empty disables the cache.
    #[serde(default)]
    pub redis_url: String,
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_max_connections() -> u32 {
    5
}
fn default_statement_timeout() -> u64 {
    30
}
fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}
fn default_rpc_timeout() -> u64 {
    30
}
fn default_gas_buffer_pct() -> u64 {
    20
}
fn default_poll_interval_ms() -> u64 {
    4_000
}
fn default_gas_start_cycle() -> u64 {
    3_000_000
}
fn default_gas_resolve_cycle() -> u64 {
    1_500_000
}
fn default_gas_evaluate_slip() -> u64 {
    800_000
}
fn default_gas_settle_pool() -> u64 {
    500_000
}
fn default_gas_place_slip() -> u64 {
    1_000_000
}
fn default_gas_create_pool() -> u64 {
    1_200_000
}
fn default_gas_claim() -> u64 {
    300_000
}
fn default_lock_ttl() -> u64 {
    30 * 60
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay() -> u64 {
    300
}
fn default_retries() -> u32 {
    3
}
fn default_dependency_window() -> u64 {
    3_600
}
fn default_dependency_max_wait() -> u64 {
    300
}
fn default_dependency_poll_ms() -> u64 {
    5_000
}
fn default_window_blocks() -> u64 {
    500
}
fn default_fallback_lookback() -> u64 {
    10_000
}
fn default_batch_size() -> usize {
    5
}
fn default_slip_spacing_ms() -> u64 {
    1_000
}
fn default_batch_spacing_ms() -> u64 {
    5_000
}
fn default_open_cycle_secs() -> u64 {
    600
}
fn default_results_secs() -> u64 {
    15 * 60
}
fn default_evaluation_secs() -> u64 {
    20 * 60
}
fn default_indexer_fallback_secs() -> u64 {
    30 * 60
}
fn default_settlement_fallback_secs() -> u64 {
    15 * 60
}
fn default_lock_cleanup_secs() -> u64 {
    5 * 60
}
fn default_retention_secs() -> u64 {
    24 * 3_600
}
fn default_execution_log_retention_days() -> i64 {
    7
}
fn default_fixture_retention_days() -> i64 {
    30
}
fn default_feed_url() -> String {
    "https://api.sportmonks.com/v3/football".to_string()
}
fn default_feed_interval_ms() -> u64 {
    1_000
}
fn default_cache_prefix() -> String {
    "bitredict".to_string()
}
fn default_cache_ttl() -> u64 {
    24 * 3_600
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            statement_timeout_secs: default_statement_timeout(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            private_key: String::new(),
            oracle_private_key: String::new(),
            oddyssey_address: String::new(),
            pool_address: String::new(),
            guided_oracle_address: String::new(),
            reputation_address: String::new(),
            rpc_timeout_secs: default_rpc_timeout(),
            gas_buffer_pct: default_gas_buffer_pct(),
            poll_interval_ms: default_poll_interval_ms(),
            gas_ceilings: GasCeilings::default(),
        }
    }
}

impl Default for GasCeilings {
    fn default() -> Self {
        Self {
            start_cycle: default_gas_start_cycle(),
            resolve_cycle: default_gas_resolve_cycle(),
            evaluate_slip: default_gas_evaluate_slip(),
            settle_pool: default_gas_settle_pool(),
            place_slip: default_gas_place_slip(),
            create_pool: default_gas_create_pool(),
            claim: default_gas_claim(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay(),
            retries: default_retries(),
            dependency_window_secs: default_dependency_window(),
            dependency_max_wait_secs: default_dependency_max_wait(),
            dependency_poll_ms: default_dependency_poll_ms(),
        }
    }
}

impl CoordinatorConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn dependency_window(&self) -> Duration {
        Duration::from_secs(self.dependency_window_secs)
    }

    pub fn dependency_max_wait(&self) -> Duration {
        Duration::from_secs(self.dependency_max_wait_secs)
    }

    pub fn dependency_poll(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_ms)
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            window_blocks: default_window_blocks(),
            fallback_lookback_blocks: default_fallback_lookback(),
            start_block: 0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            slip_spacing_ms: default_slip_spacing_ms(),
            batch_spacing_ms: default_batch_spacing_ms(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            open_cycle_secs: default_open_cycle_secs(),
            results_secs: default_results_secs(),
            evaluation_secs: default_evaluation_secs(),
            indexer_fallback_secs: default_indexer_fallback_secs(),
            settlement_fallback_secs: default_settlement_fallback_secs(),
            lock_cleanup_secs: default_lock_cleanup_secs(),
            retention_secs: default_retention_secs(),
            execution_log_retention_days: default_execution_log_retention_days(),
            fixture_retention_days: default_fixture_retention_days(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: default_feed_url(),
            api_token: String::new(),
            min_interval_ms: default_feed_interval_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            prefix: default_cache_prefix(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env();
        Ok(config)
    }

    /// Load a default config with env-only secrets (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Secrets and endpoints always come from the environment when set
    /// (never store them in the config file).
    fn apply_env(&mut self) {
        let overlay = |target: &mut String, var: &str| {
            if let Ok(v) = std::env::var(var) {
                if !v.is_empty() {
                    *target = v;
                }
            }
        };
        overlay(&mut self.database.url, "DATABASE_URL");
        overlay(&mut self.chain.rpc_url, "RPC_URL");
        overlay(&mut self.chain.private_key, "PRIVATE_KEY");
        overlay(&mut self.chain.oracle_private_key, "ORACLE_PRIVATE_KEY");
        overlay(&mut self.chain.oddyssey_address, "ODDYSSEY_ADDRESS");
        overlay(&mut self.chain.pool_address, "POOL_ADDRESS");
        overlay(&mut self.chain.guided_oracle_address, "GUIDED_ORACLE_ADDRESS");
        overlay(&mut self.chain.reputation_address, "REPUTATION_ADDRESS");
        overlay(&mut self.feed.base_url, "SPORTS_API_URL");
        overlay(&mut self.feed.api_token, "SPORTS_API_TOKEN");
        overlay(&mut self.cache.redis_url, "REDIS_URL");
    }

    /// Fail fast on settings every process needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::MissingEnv("DATABASE_URL".to_string()));
        }
        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.batch_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.coordinator.lock_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "coordinator.lock_ttl_secs".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Whether signed writes are possible.
    pub fn has_signer(&self) -> bool {
        !self.chain.private_key.is_empty()
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.database.statement_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.coordinator.lock_ttl_secs, 1_800);
        assert_eq!(config.coordinator.max_delay_secs, 300);
        assert_eq!(config.coordinator.dependency_window_secs, 3_600);
        assert_eq!(config.indexer.fallback_lookback_blocks, 10_000);
        assert_eq!(config.pipeline.batch_size, 5);
        assert_eq!(config.chain.gas_ceilings.resolve_cycle, 1_500_000);
        assert_eq!(config.schedule.execution_log_retention_days, 7);
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [coordinator]
            lock_ttl_secs = 60

            [chain.gas_ceilings]
            evaluate_slip = 900000

            [logging]
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(config.coordinator.lock_ttl_secs, 60);
        assert_eq!(config.coordinator.retries, 3);
        assert_eq!(config.chain.gas_ceilings.evaluate_slip, 900_000);
        assert_eq!(config.chain.gas_ceilings.claim, 300_000);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_requires_database() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingEnv(v)) if v == "DATABASE_URL"));
    }
}
