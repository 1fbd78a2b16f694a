//! Report rendering.
//!
//! Turns a status sample and its history into a platform-agnostic
//! [`ReportPayload`]. Rendering has no side effects beyond logging a chart
//! failure, and never fails.

mod chart;

pub use chart::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

use crate::config::{BotConfig, Color, DisplayMode, EmbedColors, TargetConfig};
use crate::history::HistoryBucket;
use crate::probe::StatusSample;

/// File name the chart is attached under.
pub const CHART_FILENAME: &str = "player-chart.png";

const NO_DESCRIPTION: &str = "No description";
const NO_ERROR_MESSAGE: &str = "Could not connect to the server";

/// Which surface a report is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// The persistent report published to the target's channel.
    Channel,
    /// A one-shot reply to the status command.
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl ReportField {
    fn new(name: &str, value: impl Into<String>, inline: bool) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            inline,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportImage {
    /// Generated image uploaded alongside the report.
    Attachment { filename: String, bytes: Vec<u8> },
    /// Image hosted elsewhere.
    Url(String),
}

/// Rendered report, ready for publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPayload {
    pub title: String,
    pub color: Color,
    pub fields: Vec<ReportField>,
    pub image: Option<ReportImage>,
    /// When the next scheduled refresh is due, if it should be shown.
    pub next_update: Option<DateTime<Utc>>,
    pub footer: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
impl ReportPayload {
    pub fn field(&self, name: &str) -> Option<&ReportField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Field labels.
pub mod labels {
    pub const SERVER: &str = "📡 Server";
    pub const STATUS: &str = "🔌 Status";
    pub const PLAYERS: &str = "👥 Players";
    pub const VERSION: &str = "🏷️ Version";
    pub const PING: &str = "📊 Ping";
    pub const MOTD: &str = "📝 MOTD";
    pub const ERROR: &str = "❌ Error";
    pub const NEXT_UPDATE: &str = "⏱️ Next Update";
}

/// Global look of every report.
#[derive(Debug, Clone)]
pub struct ReportStyle {
    pub title: String,
    pub colors: EmbedColors,
    pub footer: String,
}

impl ReportStyle {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            title: config.embed_title.clone(),
            colors: config.embed_colors,
            footer: config.footer_text.clone(),
        }
    }
}

pub struct ReportRenderer {
    style: ReportStyle,
    chart: Arc<dyn ChartRenderer>,
}

impl ReportRenderer {
    pub fn new(style: ReportStyle, chart: Arc<dyn ChartRenderer>) -> Self {
        Self { style, chart }
    }

    pub fn render(
        &self,
        kind: ReportKind,
        target: &TargetConfig,
        sample: &StatusSample,
        history: &[HistoryBucket],
        now: DateTime<Utc>,
    ) -> ReportPayload {
        let mut fields = Vec::with_capacity(8);

        let title = match kind {
            ReportKind::Channel => {
                fields.push(ReportField::new(
                    labels::SERVER,
                    format!("{} ({})", target.name, target.endpoint()),
                    true,
                ));
                self.style.title.clone()
            }
            ReportKind::Query => format!("{} Status", target.name),
        };

        let (color, next_update) = match sample {
            StatusSample::Online(status) => {
                fields.push(ReportField::new(labels::STATUS, "✅ Online", true));
                fields.push(ReportField::new(
                    labels::PLAYERS,
                    format!("{}/{}", status.players, status.max_players),
                    true,
                ));
                fields.push(ReportField::new(labels::VERSION, status.version.clone(), true));
                fields.push(ReportField::new(labels::PING, format!("{}ms", status.ping_ms), true));
                let motd = if status.motd.is_empty() { NO_DESCRIPTION } else { status.motd.as_str() };
                fields.push(ReportField::new(labels::MOTD, motd, false));

                let next_update = target
                    .show_next_update
                    .then(|| now + ChronoDuration::milliseconds(target.poll_interval_ms as i64));
                (self.style.colors.online, next_update)
            }
            StatusSample::Offline { error } => {
                fields.push(ReportField::new(labels::STATUS, "❌ Offline", true));
                let error = if error.is_empty() { NO_ERROR_MESSAGE } else { error.as_str() };
                fields.push(ReportField::new(labels::ERROR, error, false));
                (self.style.colors.offline, None)
            }
        };

        ReportPayload {
            title,
            color,
            fields,
            image: self.image(target, sample, history),
            next_update,
            footer: self.style.footer.clone(),
            timestamp: now,
        }
    }

    fn image(&self, target: &TargetConfig, sample: &StatusSample, history: &[HistoryBucket]) -> Option<ReportImage> {
        match target.display_mode {
            DisplayMode::Banner => target.banner_url.clone().map(ReportImage::Url),
            DisplayMode::None => None,
            DisplayMode::Chart => {
                if !sample.is_online() || history.len() < 2 {
                    return None;
                }
                match self.chart.render(history, target.chart_color) {
                    Ok(bytes) => Some(ReportImage::Attachment {
                        filename: CHART_FILENAME.to_string(),
                        bytes,
                    }),
                    Err(e) => {
                        tracing::error!("Failed to render chart for {}: {}", target.name, e);
                        None
                    }
                }
            }
        }
    }
}
