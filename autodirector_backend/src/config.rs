use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::datastore::LIVE_TRANSCRIPTS_TABLE;

const CONFIG_FILE_NAME: &str = "autodirector_config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningSettings {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// How many recent events are loaded into the learning snapshot.
    #[serde(default = "default_refresh_limit")]
    pub refresh_limit: usize,
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_history_limit() -> usize {
    1000
}

fn default_refresh_limit() -> usize {
    1000
}

impl Default for LearningSettings {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            history_limit: default_history_limit(),
            refresh_limit: default_refresh_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodSettings {
    #[serde(default = "default_override_minutes")]
    pub default_override_minutes: f64,
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,
}

fn default_override_minutes() -> f64 {
    5.0
}

fn default_stats_window() -> usize {
    100
}

impl Default for MoodSettings {
    fn default() -> Self {
        Self {
            default_override_minutes: default_override_minutes(),
            stats_window: default_stats_window(),
        }
    }
}

/// Process-level settings. Routing policy (thresholds, allowlist, rate
/// limits) lives in the datastore as [`crate::automation::config::AutomationConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Overlay / OBS bridge that receives routed actions. Actions are only
    /// logged when unset.
    #[serde(default)]
    pub action_webhook_url: Option<String>,
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Studio offset from UTC, used for rule day/time windows.
    #[serde(default)]
    pub timezone_offset_minutes: i32,
    #[serde(default = "default_transcript_table")]
    pub transcript_table: String,
    /// Tables whose row changes feed event-trigger rules.
    #[serde(default)]
    pub watched_tables: Vec<String>,
    #[serde(default)]
    pub learning: LearningSettings,
    #[serde(default)]
    pub mood: MoodSettings,
}

fn default_database_path() -> String {
    "autodirector.db".to_string()
}

fn default_action_timeout_secs() -> u64 {
    5
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_transcript_table() -> String {
    LIVE_TRANSCRIPTS_TABLE.to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            action_webhook_url: None,
            action_timeout_secs: default_action_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            timezone_offset_minutes: 0,
            transcript_table: default_transcript_table(),
            watched_tables: Vec::new(),
            learning: LearningSettings::default(),
            mood: MoodSettings::default(),
        }
    }
}

impl BackendConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Config file next to the executable.
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join(CONFIG_FILE_NAME)
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("autodirector").join(CONFIG_FILE_NAME))
    }

    /// Load from the executable's directory, then the user config dir, then
    /// defaults. Env vars are applied on top in every case.
    pub fn load() -> Self {
        let candidates = std::iter::once(Self::config_path()).chain(Self::user_config_path());
        for path in candidates {
            let Ok(contents) = fs::read_to_string(&path) else {
                continue;
            };
            match Self::parse(&contents) {
                Ok(mut config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config.apply_env();
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {:#}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("invalid backend config")
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(path) = env::var("AUTODIRECTOR_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(url) = env::var("AUTODIRECTOR_ACTION_WEBHOOK_URL") {
            self.action_webhook_url = Some(url).filter(|url| !url.trim().is_empty());
        }

        if let Ok(timeout) = env::var("AUTODIRECTOR_ACTION_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse() {
                self.action_timeout_secs = seconds;
            }
        }

        if let Ok(interval) = env::var("AUTODIRECTOR_TICK_INTERVAL_MS") {
            if let Ok(millis) = interval.parse() {
                self.tick_interval_ms = millis;
            }
        }

        if let Ok(offset) = env::var("AUTODIRECTOR_TIMEZONE_OFFSET_MINUTES") {
            if let Ok(minutes) = offset.parse() {
                self.timezone_offset_minutes = minutes;
            }
        }

        if let Ok(tables) = env::var("AUTODIRECTOR_WATCHED_TABLES") {
            self.watched_tables = tables
                .split(',')
                .map(str::trim)
                .filter(|table| !table.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(rate) = env::var("AUTODIRECTOR_LEARNING_RATE") {
            if let Ok(rate) = rate.parse() {
                self.learning.learning_rate = rate;
            }
        }
    }
}
