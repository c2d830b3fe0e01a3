//! TOML configuration for the chat service and the training worker.
//!
//! Both processes read the same file so that they agree on the queue
//! database, the model directory and the token secret.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub irc: IrcConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    pub models: ModelsConfig,
    pub library: LibraryConfig,
    pub token: TokenConfig,
    #[serde(default)]
    pub recommend: RecommendConfig,
    #[serde(default)]
    pub supply: SupplyConfig,
    pub train: TrainConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IrcConfig {
    pub host: String,
    #[serde(default = "default_irc_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Channel joined after the handshake, without the leading `#`.
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_irc_port() -> u16 {
    6667
}
fn default_channel() -> String {
    "osu".to_string()
}

/// Which messages the dispatcher accepts and how replies leave the process.
#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// `"channels"` accepts private messages (and any extra channels below);
    /// `"self-test"` accepts only messages sent by the bot's own nick.
    #[serde(default = "default_dispatch_mode")]
    pub mode: String,
    /// Additional message targets accepted in `channels` mode. The bot's own
    /// nick is always included.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Echo every reply to stdout before sending it.
    #[serde(default)]
    pub echo: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: default_dispatch_mode(),
            channels: Vec::new(),
            echo: false,
        }
    }
}

fn default_dispatch_mode() -> String {
    "channels".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    pub dir: PathBuf,
    #[serde(default = "default_model_cache_size")]
    pub cache_size: usize,
}

fn default_model_cache_size() -> usize {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct LibraryConfig {
    /// JSON catalog consumed by [`crate::catalog::CatalogConnector`].
    pub catalog: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    pub secret_path: PathBuf,
    #[serde(default = "default_token_ttl_hours")]
    pub ttl_hours: i64,
}

fn default_token_ttl_hours() -> i64 {
    12
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecommendConfig {
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_min_accuracy")]
    pub min_accuracy: f64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_stats_ttl_secs")]
    pub stats_ttl_secs: i64,
    #[serde(default = "default_link_base")]
    pub link_base: String,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            max_candidates: default_max_candidates(),
            min_accuracy: default_min_accuracy(),
            history_limit: default_history_limit(),
            stats_ttl_secs: default_stats_ttl_secs(),
            link_base: default_link_base(),
        }
    }
}

fn default_max_candidates() -> usize {
    50
}
fn default_min_accuracy() -> f64 {
    0.95
}
fn default_history_limit() -> usize {
    100
}
fn default_stats_ttl_secs() -> i64 {
    2 * 60 * 60
}
fn default_link_base() -> String {
    "https://osu.ppy.sh/b/".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupplyConfig {
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    #[serde(default = "default_refill_limit")]
    pub refill_limit: usize,
    #[serde(default = "default_min_elements")]
    pub min_elements: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            refill_limit: default_refill_limit(),
            min_elements: default_min_elements(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_window_days() -> i64 {
    365
}
fn default_refill_limit() -> usize {
    500
}
fn default_min_elements() -> usize {
    2
}
fn default_retry_delay_ms() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrainConfig {
    /// Executable run once per job in its own process.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub replay_dir: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_lease_secs() -> u64 {
    60 * 60
}
fn default_report_interval_secs() -> u64 {
    10
}

impl TrainConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_upload_url")]
    pub url: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            url: default_upload_url(),
        }
    }
}

fn default_upload_url() -> String {
    "http://localhost:5000/".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// A config rooted in `./data` with every optional section defaulted.
    pub fn minimal() -> Self {
        let data = PathBuf::from("./data");
        Self {
            db: DbConfig {
                path: data.join("combine.sqlite"),
                busy_timeout_ms: default_busy_timeout_ms(),
            },
            irc: IrcConfig {
                host: "localhost".to_string(),
                port: default_irc_port(),
                username: "combine".to_string(),
                password: String::new(),
                channel: default_channel(),
            },
            dispatch: DispatchConfig::default(),
            models: ModelsConfig {
                dir: data.join("models"),
                cache_size: default_model_cache_size(),
            },
            library: LibraryConfig {
                catalog: data.join("catalog.json"),
            },
            token: TokenConfig {
                secret_path: data.join("token-secret"),
                ttl_hours: default_token_ttl_hours(),
            },
            recommend: RecommendConfig::default(),
            supply: SupplyConfig::default(),
            train: TrainConfig {
                command: "combine-train".to_string(),
                args: Vec::new(),
                replay_dir: data.join("replays"),
                poll_interval_ms: default_poll_interval_ms(),
                lease_secs: default_lease_secs(),
                report_interval_secs: default_report_interval_secs(),
            },
            upload: UploadConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn is_self_test(&self) -> bool {
        self.dispatch.mode == "self-test"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

// Upper bounds keep the chrono conversions downstream in range.
const MAX_TOKEN_TTL_HOURS: i64 = 24 * 365;
const MAX_STATS_TTL_SECS: i64 = 30 * 24 * 60 * 60;
const MAX_WINDOW_DAYS: i64 = 100 * 365;

fn validate(config: &Config) -> Result<()> {
    if config.irc.username.trim().is_empty() {
        anyhow::bail!("irc.username must not be empty");
    }
    if config.irc.channel.starts_with('#') {
        anyhow::bail!("irc.channel must be given without the leading '#'");
    }

    match config.dispatch.mode.as_str() {
        "channels" | "self-test" => {}
        other => anyhow::bail!(
            "Unknown dispatch mode: '{}'. Must be channels or self-test.",
            other
        ),
    }

    if config.models.cache_size == 0 {
        anyhow::bail!("models.cache_size must be > 0");
    }
    if !(1..=MAX_TOKEN_TTL_HOURS).contains(&config.token.ttl_hours) {
        anyhow::bail!("token.ttl_hours must be in [1, {}]", MAX_TOKEN_TTL_HOURS);
    }

    if config.recommend.max_candidates == 0 {
        anyhow::bail!("recommend.max_candidates must be > 0");
    }
    if !(0.0..=1.0).contains(&config.recommend.min_accuracy) {
        anyhow::bail!("recommend.min_accuracy must be in [0.0, 1.0]");
    }
    if config.recommend.history_limit == 0 {
        anyhow::bail!("recommend.history_limit must be > 0");
    }
    if !(1..=MAX_STATS_TTL_SECS).contains(&config.recommend.stats_ttl_secs) {
        anyhow::bail!("recommend.stats_ttl_secs must be in [1, {}]", MAX_STATS_TTL_SECS);
    }

    if !(1..=MAX_WINDOW_DAYS).contains(&config.supply.window_days) {
        anyhow::bail!("supply.window_days must be in [1, {}]", MAX_WINDOW_DAYS);
    }
    if config.supply.refill_limit == 0 {
        anyhow::bail!("supply.refill_limit must be > 0");
    }

    if config.train.command.trim().is_empty() {
        anyhow::bail!("train.command must not be empty");
    }
    if config.train.report_interval_secs == 0 {
        anyhow::bail!("train.report_interval_secs must be > 0");
    }

    Ok(())
}
