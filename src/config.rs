//! Configuration module for mcwatch.
//!
//! Loads the bot and target configuration from a JSON file, with a few
//! environment variable overrides.

use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::publish::EditFailurePolicy;
use crate::scheduler::OverlapPolicy;

/// Default config file path, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Discord caps a single option at 25 choices.
const MAX_TARGETS: usize = 25;
const MIN_POLL_INTERVAL_MS: u64 = 1000;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// An RGB colour written as `#rrggbb` in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Color(pub u32);

impl Color {
    pub fn rgb(self) -> (u8, u8, u8) {
        ((self.0 >> 16) as u8, (self.0 >> 8) as u8, self.0 as u8)
    }
}

impl TryFrom<String> for Color {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let hex = value.trim().trim_start_matches('#');
        if hex.len() != 6 {
            return Err(format!("invalid colour {:?}, expected #rrggbb", value));
        }
        u32::from_str_radix(hex, 16)
            .map(Color)
            .map_err(|_| format!("invalid colour {:?}, expected #rrggbb", value))
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06x}", self.0)
    }
}

/// What image, if any, accompanies a target's report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Player count history chart.
    #[default]
    Chart,
    /// Static banner image referenced by URL.
    Banner,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EmbedColors {
    pub online: Color,
    pub offline: Color,
}

impl Default for EmbedColors {
    fn default() -> Self {
        Self {
            online: Color(0x2ecc71),
            offline: Color(0xe74c3c),
        }
    }
}

/// One monitored game server. Immutable for the process lifetime.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub channel_id: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub display_mode: DisplayMode,
    #[serde(default = "default_history_window")]
    pub history_window_hours: usize,
    #[serde(default = "default_chart_color")]
    pub chart_color: Color,
    #[serde(default)]
    pub banner_url: Option<String>,
    #[serde(default = "default_true")]
    pub show_next_update: bool,
}

impl TargetConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `host:port` as shown in reports and logs.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    #[serde(default)]
    pub bot_token: String,
    pub application_id: u64,
    #[serde(default = "default_presence")]
    pub presence_text: String,
    #[serde(default = "default_embed_title")]
    pub embed_title: String,
    #[serde(default)]
    pub embed_colors: EmbedColors,
    #[serde(default = "default_footer")]
    pub footer_text: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
    #[serde(default)]
    pub edit_failure_policy: EditFailurePolicy,
    /// TTF/OTF font used for chart axis labels.
    #[serde(default)]
    pub chart_font: Option<PathBuf>,
    pub targets: Vec<TargetConfig>,
}

fn default_port() -> u16 {
    25565
}

fn default_poll_interval_ms() -> u64 {
    60_000
}

fn default_history_window() -> usize {
    crate::history::DEFAULT_CAPACITY
}

fn default_chart_color() -> Color {
    Color(0x3498db)
}

fn default_true() -> bool {
    true
}

fn default_presence() -> String {
    "Minecraft servers".to_string()
}

fn default_embed_title() -> String {
    "Minecraft Server Status".to_string()
}

fn default_footer() -> String {
    "mcwatch".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

impl BotConfig {
    /// Resolve the config path from the CLI flag, then `MCWATCH_CONFIG`,
    /// then the default.
    pub fn resolve_path(cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| env::var("MCWATCH_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load and validate configuration from a JSON file.
    ///
    /// Environment variables:
    /// - `MCWATCH_BOT_TOKEN`: overrides `botToken` from the file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = Self::from_json(&raw)?;

        if let Ok(token) = env::var("MCWATCH_BOT_TOKEN") {
            if !token.is_empty() {
                cfg.bot_token = token;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse without validating or applying overrides.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Case-insensitive lookup by target name.
    pub fn find_target(&self, name: &str) -> Option<&TargetConfig> {
        let wanted = name.trim().to_lowercase();
        self.targets.iter().find(|t| t.name.to_lowercase() == wanted)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot_token.trim().is_empty() {
            return Err(invalid("botToken is empty (set it or MCWATCH_BOT_TOKEN)"));
        }
        if self.application_id == 0 {
            return Err(invalid("applicationId must be non-zero"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(invalid("probeTimeoutMs must be non-zero"));
        }
        if self.targets.is_empty() {
            return Err(invalid("at least one target is required"));
        }
        if self.targets.len() > MAX_TARGETS {
            return Err(ConfigError::Invalid(format!(
                "at most {} targets are supported, got {}",
                MAX_TARGETS,
                self.targets.len()
            )));
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            let name = target.name.trim();
            if name.is_empty() {
                return Err(invalid("target name cannot be empty"));
            }
            if !names.insert(name.to_lowercase()) {
                return Err(ConfigError::Invalid(format!("duplicate target name {:?}", name)));
            }
            if target.address.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{}: address is empty", name)));
            }
            if target.channel_id == 0 {
                return Err(ConfigError::Invalid(format!("{}: channelId must be non-zero", name)));
            }
            if target.poll_interval_ms < MIN_POLL_INTERVAL_MS {
                return Err(ConfigError::Invalid(format!(
                    "{}: pollIntervalMs must be at least {}",
                    name, MIN_POLL_INTERVAL_MS
                )));
            }
            if target.history_window_hours == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}: historyWindowHours must be at least 1",
                    name
                )));
            }
            if target.display_mode == DisplayMode::Banner
                && target.banner_url.as_deref().map_or(true, |u| u.trim().is_empty())
            {
                return Err(ConfigError::Invalid(format!(
                    "{}: banner display mode requires bannerUrl",
                    name
                )));
            }
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

#[cfg(test)]
pub(crate) fn test_target(name: &str) -> TargetConfig {
    TargetConfig {
        name: name.to_string(),
        address: "play.example.net".to_string(),
        port: 25565,
        channel_id: 42,
        poll_interval_ms: 1000,
        display_mode: DisplayMode::Chart,
        history_window_hours: 24,
        chart_color: Color(0x3498db),
        banner_url: None,
        show_next_update: true,
    }
}
