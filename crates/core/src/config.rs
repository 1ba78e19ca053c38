use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `ASTRO_ANALYTICS__` and TOML config files.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub experiments: ExperimentsConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Maximum tolerated clock skew for `occurred_at` timestamps in the
    /// future. Events further ahead are rejected at validation.
    #[serde(default = "default_max_future_skew_hours")]
    pub max_future_skew_hours: i64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_max_future_skew_hours() -> i64 { 24 }
fn default_channel_capacity() -> usize { 100_000 }
fn default_batch_size() -> usize { 500 }
fn default_flush_interval_ms() -> u64 { 1_000 }

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentsConfig {
    #[serde(default)]
    pub counting: CountingMode,
}

/// How impressions and conversions are tallied per variant.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CountingMode {
    /// One subject counts once no matter how many events it emits.
    #[default]
    DistinctSubjects,
    RawEvents,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    /// Window applied when a dashboard query names no explicit range.
    #[serde(default = "default_window_days")]
    pub default_window_days: i64,
}

fn default_cache_ttl_secs() -> u64 { 30 }
fn default_cache_max_entries() -> usize { 1_024 }
fn default_window_days() -> i64 { 30 }

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_future_skew_hours: default_max_future_skew_hours(),
            channel_capacity: default_channel_capacity(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Default for ExperimentsConfig {
    fn default() -> Self {
        Self {
            counting: CountingMode::default(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
            default_window_days: default_window_days(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            experiments: ExperimentsConfig::default(),
            dashboard: DashboardConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn max_future_skew(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_future_skew_hours)
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("ASTRO_ANALYTICS")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
