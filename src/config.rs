use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const DEFAULT_LISTENER_PORT: u16 = 4_000;
const DEFAULT_EXPECTED_MEMBERS: u32 = 3;
const DEFAULT_TARGET_ENTRIES: u64 = 1 << 17;
const DEFAULT_VALUE_SIZE_BYTES: usize = 1 << 15;
const DEFAULT_FIRST_KEY: i64 = 0;
const DEFAULT_PAYLOAD_SEED: u64 = 42;
const DEFAULT_WINDOW_CAPACITY: usize = 1 << 12;
const DEFAULT_MIN_POPULATION_PERCENT: u8 = 25;
const DEFAULT_OUTLIER_THRESHOLD_STDDEV: f64 = 10.0;
const DEFAULT_WORKERS: usize = 6;
const DEFAULT_QUEUE_SIZE: usize = 96;
const DEFAULT_SUBMIT_BACKOFF_MS: u64 = 250;
const DEFAULT_DRAIN_GRACE_MS: u64 = 2_000;
const DEFAULT_STATS_REPORT_INTERVAL_MS: u64 = 4_000;
const DEFAULT_CHAOS_DURATION_MS: u64 = 70_000;
const DEFAULT_STATE_CHECK_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MIGRATION_CHECK_INTERVAL_MS: u64 = 4_000;
const DEFAULT_FILL_CHECK_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RESPONDER_WAIT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_LOCAL_CHAOS_START_DELAY_MS: u64 = 5_000;
const DEFAULT_LOCAL_MIGRATION_SETTLE_DELAY_MS: u64 = 3_000;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listener: ListenerConfig,
    pub cluster: ClusterConfig,
    pub map: MapConfig,
    pub stats: StatsConfig,
    pub driver: DriverConfig,
    pub test: TestPlanConfig,
    pub local: LocalModeConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                DEFAULT_LISTENER_PORT,
            )),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub expected_members: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            expected_members: DEFAULT_EXPECTED_MEMBERS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub target_entries: u64,
    pub value_size_bytes: usize,
    pub first_key: i64,
    pub payload_seed: u64,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            target_entries: DEFAULT_TARGET_ENTRIES,
            value_size_bytes: DEFAULT_VALUE_SIZE_BYTES,
            first_key: DEFAULT_FIRST_KEY,
            payload_seed: DEFAULT_PAYLOAD_SEED,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub window_capacity: usize,
    pub min_population_percent: u8,
    pub outlier_threshold_stddev: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            min_population_percent: DEFAULT_MIN_POPULATION_PERCENT,
            outlier_threshold_stddev: DEFAULT_OUTLIER_THRESHOLD_STDDEV,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub submit_backoff_ms: u64,
    pub drain_grace_ms: u64,
    pub stats_report_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_size: DEFAULT_QUEUE_SIZE,
            submit_backoff_ms: DEFAULT_SUBMIT_BACKOFF_MS,
            drain_grace_ms: DEFAULT_DRAIN_GRACE_MS,
            stats_report_interval_ms: DEFAULT_STATS_REPORT_INTERVAL_MS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TestPlanConfig {
    pub chaos_duration_ms: u64,
    pub state_check_interval_ms: u64,
    pub migration_check_interval_ms: u64,
    pub fill_check_interval_ms: u64,
    pub responder_wait_timeout_ms: u64,
    pub repeat: bool,
    pub artifact_path: Option<PathBuf>,
}

impl Default for TestPlanConfig {
    fn default() -> Self {
        Self {
            chaos_duration_ms: DEFAULT_CHAOS_DURATION_MS,
            state_check_interval_ms: DEFAULT_STATE_CHECK_INTERVAL_MS,
            migration_check_interval_ms: DEFAULT_MIGRATION_CHECK_INTERVAL_MS,
            fill_check_interval_ms: DEFAULT_FILL_CHECK_INTERVAL_MS,
            responder_wait_timeout_ms: DEFAULT_RESPONDER_WAIT_TIMEOUT_MS,
            repeat: false,
            artifact_path: None,
        }
    }
}

/// Delays for the self-driven local mode, where the driver injects the
/// peer-side signals itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalModeConfig {
    pub chaos_start_delay_ms: u64,
    pub migration_settle_delay_ms: u64,
}

impl Default for LocalModeConfig {
    fn default() -> Self {
        Self {
            chaos_start_delay_ms: DEFAULT_LOCAL_CHAOS_START_DELAY_MS,
            migration_settle_delay_ms: DEFAULT_LOCAL_MIGRATION_SETTLE_DELAY_MS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config at {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

/// Loads driver configuration from a TOML file.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be read, parsed, or
/// validated.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config = toml::from_str::<AppConfig>(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    validate(path, &config)?;
    Ok(config)
}

fn validate(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    validate_listener(path, &config.listener)?;
    validate_cluster(path, &config.cluster)?;
    validate_map(path, &config.map)?;
    validate_stats(path, &config.stats)?;
    validate_driver(path, &config.driver)?;
    validate_test(path, &config.test)?;
    validate_local(path, &config.local)
}

fn validate_listener(path: &Path, listener: &ListenerConfig) -> Result<(), ConfigError> {
    if listener.bind_addr.port() == 0 {
        return Err(invalid(path, "`listener.bind_addr` must use a non-zero port"));
    }
    Ok(())
}

fn validate_cluster(path: &Path, cluster: &ClusterConfig) -> Result<(), ConfigError> {
    if cluster.expected_members == 0 {
        return Err(invalid(path, "`cluster.expected_members` must be > 0"));
    }
    Ok(())
}

fn validate_map(path: &Path, map: &MapConfig) -> Result<(), ConfigError> {
    if map.target_entries == 0 {
        return Err(invalid(path, "`map.target_entries` must be > 0"));
    }
    if map.value_size_bytes == 0 {
        return Err(invalid(path, "`map.value_size_bytes` must be > 0"));
    }
    Ok(())
}

fn validate_stats(path: &Path, stats: &StatsConfig) -> Result<(), ConfigError> {
    if stats.window_capacity == 0 {
        return Err(invalid(path, "`stats.window_capacity` must be > 0"));
    }
    if stats.min_population_percent == 0 || stats.min_population_percent > 100 {
        return Err(invalid(
            path,
            "`stats.min_population_percent` must be in [1, 100]",
        ));
    }
    if !stats.outlier_threshold_stddev.is_finite() || stats.outlier_threshold_stddev <= 0.0 {
        return Err(invalid(
            path,
            "`stats.outlier_threshold_stddev` must be a finite number > 0",
        ));
    }
    Ok(())
}

fn validate_driver(path: &Path, driver: &DriverConfig) -> Result<(), ConfigError> {
    if driver.workers == 0 {
        return Err(invalid(path, "`driver.workers` must be > 0"));
    }
    if driver.queue_size == 0 {
        return Err(invalid(path, "`driver.queue_size` must be > 0"));
    }
    if driver.submit_backoff_ms == 0 {
        return Err(invalid(path, "`driver.submit_backoff_ms` must be > 0"));
    }
    if driver.drain_grace_ms == 0 {
        return Err(invalid(path, "`driver.drain_grace_ms` must be > 0"));
    }
    if driver.stats_report_interval_ms == 0 {
        return Err(invalid(path, "`driver.stats_report_interval_ms` must be > 0"));
    }
    Ok(())
}

fn validate_test(path: &Path, test: &TestPlanConfig) -> Result<(), ConfigError> {
    if test.chaos_duration_ms == 0 {
        return Err(invalid(path, "`test.chaos_duration_ms` must be > 0"));
    }
    if test.state_check_interval_ms == 0 {
        return Err(invalid(path, "`test.state_check_interval_ms` must be > 0"));
    }
    if test.migration_check_interval_ms == 0 {
        return Err(invalid(path, "`test.migration_check_interval_ms` must be > 0"));
    }
    if test.fill_check_interval_ms == 0 {
        return Err(invalid(path, "`test.fill_check_interval_ms` must be > 0"));
    }
    if test.responder_wait_timeout_ms == 0 {
        return Err(invalid(path, "`test.responder_wait_timeout_ms` must be > 0"));
    }
    Ok(())
}

fn validate_local(path: &Path, local: &LocalModeConfig) -> Result<(), ConfigError> {
    if local.chaos_start_delay_ms == 0 {
        return Err(invalid(path, "`local.chaos_start_delay_ms` must be > 0"));
    }
    if local.migration_settle_delay_ms == 0 {
        return Err(invalid(path, "`local.migration_settle_delay_ms` must be > 0"));
    }
    Ok(())
}

fn invalid(path: &Path, message: &'static str) -> ConfigError {
    ConfigError::Invalid {
        path: path.to_path_buf(),
        message: message.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::{
        AppConfig, ConfigError, DriverConfig, StatsConfig, TestPlanConfig, load_config, validate,
        validate_driver, validate_stats, validate_test,
    };

    #[test]
    fn defaults_validate_cleanly() {
        let config = AppConfig::default();
        assert!(validate(Path::new("driver.toml"), &config).is_ok());
    }

    #[test]
    fn validate_stats_rejects_out_of_range_population_percent() {
        let path = Path::new("driver.toml");
        for percent in [0_u8, 101] {
            let stats = StatsConfig {
                min_population_percent: percent,
                ..StatsConfig::default()
            };
            assert!(matches!(
                validate_stats(path, &stats),
                Err(ConfigError::Invalid { message, .. })
                    if message == "`stats.min_population_percent` must be in [1, 100]"
            ));
        }
    }

    #[test]
    fn validate_stats_rejects_non_finite_outlier_threshold() {
        let path = Path::new("driver.toml");
        for threshold in [0.0, -1.0, f64::INFINITY, f64::NAN] {
            let stats = StatsConfig {
                outlier_threshold_stddev: threshold,
                ..StatsConfig::default()
            };
            assert!(matches!(
                validate_stats(path, &stats),
                Err(ConfigError::Invalid { message, .. })
                    if message == "`stats.outlier_threshold_stddev` must be a finite number > 0"
            ));
        }
    }

    #[test]
    fn validate_driver_rejects_zero_workers() {
        let driver = DriverConfig {
            workers: 0,
            ..DriverConfig::default()
        };
        assert!(matches!(
            validate_driver(Path::new("driver.toml"), &driver),
            Err(ConfigError::Invalid { message, .. }) if message == "`driver.workers` must be > 0"
        ));
    }

    #[test]
    fn validate_test_rejects_zero_chaos_duration() {
        let test = TestPlanConfig {
            chaos_duration_ms: 0,
            ..TestPlanConfig::default()
        };
        assert!(matches!(
            validate_test(Path::new("driver.toml"), &test),
            Err(ConfigError::Invalid { message, .. })
                if message == "`test.chaos_duration_ms` must be > 0"
        ));
    }

    #[test]
    fn load_config_applies_partial_overrides_over_defaults() {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0_u128, |duration| duration.as_nanos());
        let config_path = std::env::temp_dir().join(format!("chaos-driver-config-{unique}.toml"));

        let payload = r#"
[listener]
bind_addr = "127.0.0.1:4100"

[driver]
workers = 2

[test]
chaos_duration_ms = 5000
repeat = true
"#;
        assert!(fs::write(&config_path, payload).is_ok());

        let loaded = load_config(&config_path);
        let _ = fs::remove_file(&config_path);

        assert!(loaded.is_ok());
        let Ok(config) = loaded else {
            unreachable!("asserted above");
        };
        assert_eq!(config.listener.bind_addr.port(), 4_100);
        assert_eq!(config.driver.workers, 2);
        assert_eq!(config.test.chaos_duration_ms, 5_000);
        assert!(config.test.repeat);
        // Untouched sections keep their defaults.
        assert_eq!(config.stats.min_population_percent, 25);
        assert_eq!(config.cluster.expected_members, 3);
    }

    #[test]
    fn load_config_rejects_zero_queue_size() {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0_u128, |duration| duration.as_nanos());
        let config_path =
            std::env::temp_dir().join(format!("chaos-driver-bad-config-{unique}.toml"));

        let payload = r#"
[driver]
queue_size = 0
"#;
        assert!(fs::write(&config_path, payload).is_ok());

        let loaded = load_config(&config_path);
        let _ = fs::remove_file(&config_path);

        assert!(matches!(
            loaded,
            Err(ConfigError::Invalid { message, .. })
                if message == "`driver.queue_size` must be > 0"
        ));
    }
}
