//! Configuration loading.
//!
//! Sources, later ones winning: built-in defaults, an optional TOML file,
//! then `SEATWATCH_*` environment variables (a `.env` file is read first).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Lowest allowed cache refresh interval
pub const MIN_UPDATE_INTERVAL_SECS: u64 = 3600;
/// Lowest allowed check interval
pub const MIN_CHECK_INTERVAL_SECS: u64 = 60;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub intervals: IntervalConfig,
    pub checker: CheckerConfig,
    pub notifications: NotificationConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file holding watch requests
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/course_watches.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    /// Seconds between cache refreshes
    pub update_secs: u64,
    /// Seconds between check cycles
    pub check_secs: u64,
    /// Delay before the first check cycle, giving the cache time to load
    pub initial_check_delay_secs: u64,
    /// Pause between the two reads of a double-checked refresh
    pub confirm_delay_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            update_secs: MIN_UPDATE_INTERVAL_SECS,
            check_secs: MIN_CHECK_INTERVAL_SECS,
            initial_check_delay_secs: 15,
            confirm_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Hard limit on one batch detail fetch
    pub fetch_timeout_secs: u64,
    /// Limit on the live lookup made while adding a watch
    pub live_fetch_timeout_secs: u64,
    pub empty_cycle_threshold: u32,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 5,
            live_fetch_timeout_secs: 30,
            empty_cycle_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Base URL of the public timetable, used for links in emails
    pub timetable_url: String,
    /// Optional Handlebars template replacing the built-in one
    pub template_path: Option<PathBuf>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            timetable_url: "https://mytimetable.mcmaster.ca".to_string(),
            template_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Loads `.env`, the optional TOML file and environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.normalized()
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Applies `SEATWATCH_*` overrides supplied by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SEATWATCH_DATABASE_PATH") {
            self.database.path = PathBuf::from(v);
        }
        override_parsed(&lookup, "SEATWATCH_UPDATE_INTERVAL_SECS", &mut self.intervals.update_secs)?;
        override_parsed(&lookup, "SEATWATCH_CHECK_INTERVAL_SECS", &mut self.intervals.check_secs)?;
        override_parsed(
            &lookup,
            "SEATWATCH_INITIAL_CHECK_DELAY_SECS",
            &mut self.intervals.initial_check_delay_secs,
        )?;
        override_parsed(&lookup, "SEATWATCH_CONFIRM_DELAY_SECS", &mut self.intervals.confirm_delay_secs)?;
        override_parsed(&lookup, "SEATWATCH_FETCH_TIMEOUT_SECS", &mut self.checker.fetch_timeout_secs)?;
        override_parsed(
            &lookup,
            "SEATWATCH_LIVE_FETCH_TIMEOUT_SECS",
            &mut self.checker.live_fetch_timeout_secs,
        )?;
        override_parsed(
            &lookup,
            "SEATWATCH_EMPTY_CYCLE_THRESHOLD",
            &mut self.checker.empty_cycle_threshold,
        )?;
        override_parsed(&lookup, "SEATWATCH_NOTIFY_WORKERS", &mut self.notifications.workers)?;
        override_parsed(&lookup, "SEATWATCH_QUEUE_CAPACITY", &mut self.notifications.queue_capacity)?;
        if let Some(v) = lookup("SEATWATCH_TIMETABLE_URL") {
            self.notifications.timetable_url = v;
        }
        if let Some(v) = lookup("SEATWATCH_TEMPLATE_PATH") {
            self.notifications.template_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SEATWATCH_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("SEATWATCH_LOG_LEVEL") {
            self.logging.level = v;
        }
        override_parsed(&lookup, "SEATWATCH_LOG_JSON", &mut self.logging.json)?;
        Ok(())
    }

    /// Clamps intervals to their floors and rejects unusable values.
    pub fn normalized(mut self) -> Result<Self> {
        if self.intervals.update_secs < MIN_UPDATE_INTERVAL_SECS {
            warn!(
                configured = self.intervals.update_secs,
                minimum = MIN_UPDATE_INTERVAL_SECS,
                "Update interval below minimum, clamping"
            );
            self.intervals.update_secs = MIN_UPDATE_INTERVAL_SECS;
        }
        if self.intervals.check_secs < MIN_CHECK_INTERVAL_SECS {
            warn!(
                configured = self.intervals.check_secs,
                minimum = MIN_CHECK_INTERVAL_SECS,
                "Check interval below minimum, clamping"
            );
            self.intervals.check_secs = MIN_CHECK_INTERVAL_SECS;
        }

        if self.notifications.workers == 0 {
            anyhow::bail!("notifications.workers must be greater than 0");
        }
        if self.notifications.queue_capacity == 0 {
            anyhow::bail!("notifications.queue_capacity must be greater than 0");
        }
        if self.checker.fetch_timeout_secs == 0 {
            anyhow::bail!("checker.fetch_timeout_secs must be greater than 0");
        }
        if self.checker.live_fetch_timeout_secs == 0 {
            anyhow::bail!("checker.live_fetch_timeout_secs must be greater than 0");
        }
        if self.checker.empty_cycle_threshold == 0 {
            anyhow::bail!("checker.empty_cycle_threshold must be greater than 0");
        }
        Ok(self)
    }

    #[must_use]
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.update_secs)
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.check_secs)
    }

    #[must_use]
    pub fn initial_check_delay(&self) -> Duration {
        Duration::from_secs(self.intervals.initial_check_delay_secs)
    }

    #[must_use]
    pub fn confirm_delay(&self) -> Duration {
        Duration::from_secs(self.intervals.confirm_delay_secs)
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.checker.fetch_timeout_secs)
    }

    #[must_use]
    pub fn live_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.checker.live_fetch_timeout_secs)
    }
}

fn override_parsed<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {key}: '{raw}' ({e})"))?;
    }
    Ok(())
}
