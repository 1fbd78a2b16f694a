//! Discord side of the bot: REST publishing through twilight-http and the
//! gateway loop that receives slash commands.

pub mod commands;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use twilight_gateway::{ConfigBuilder, Event, EventTypeFlags, Intents, Shard, ShardId, StreamExt};
use twilight_http::client::ClientBuilder;
use twilight_http::error::ErrorType;
use twilight_http::Client as HttpClient;
use twilight_model::channel::message::Embed;
use twilight_model::gateway::payload::outgoing::update_presence::UpdatePresencePayload;
use twilight_model::gateway::presence::{ActivityType, MinimalActivity, Status};
use twilight_model::http::attachment::Attachment;
use twilight_model::id::marker::{ApplicationMarker, ChannelMarker, MessageMarker};
use twilight_model::id::Id;
use twilight_model::util::Timestamp;
use twilight_util::builder::embed::{EmbedBuilder, EmbedFieldBuilder, EmbedFooterBuilder, ImageSource};

use crate::config::BotConfig;
use crate::publish::{ChatClient, ChatError, MessageHandle};
use crate::report::{labels, ReportImage, ReportPayload};
use crate::scheduler::Monitor;

/// Discord adapter error types.
#[derive(Error, Debug)]
pub enum DiscordError {
    #[error("HTTP error: {0}")]
    Http(#[from] twilight_http::Error),
    #[error("invalid presence: {0}")]
    Presence(String),
    #[error("applicationId {0} is not a valid id")]
    InvalidApplicationId(u64),
}

pub fn http_client(token: &str) -> Arc<HttpClient> {
    Arc::new(
        ClientBuilder::new()
            .token(token.to_string())
            .timeout(Duration::from_secs(30))
            .build(),
    )
}

pub fn application_id(config: &BotConfig) -> Result<Id<ApplicationMarker>, DiscordError> {
    Id::new_checked(config.application_id).ok_or(DiscordError::InvalidApplicationId(config.application_id))
}

fn channel_id(raw: u64) -> Result<Id<ChannelMarker>, ChatError> {
    Id::new_checked(raw).ok_or_else(|| ChatError::InvalidId(format!("channel {}", raw)))
}

fn message_id(raw: u64) -> Result<Id<MessageMarker>, ChatError> {
    Id::new_checked(raw).ok_or_else(|| ChatError::InvalidId(format!("message {}", raw)))
}

fn status_of(e: &twilight_http::Error) -> Option<u16> {
    match e.kind() {
        ErrorType::Response { status, .. } => Some(status.get()),
        _ => None,
    }
}

fn rejected(e: twilight_http::Error) -> ChatError {
    ChatError::Rejected(e.to_string())
}

/// Convert a report into a Discord embed.
pub fn build_embed(payload: &ReportPayload) -> Result<Embed, ChatError> {
    let mut builder = EmbedBuilder::new()
        .title(payload.title.as_str())
        .color(payload.color.0)
        .footer(EmbedFooterBuilder::new(payload.footer.as_str()));

    for field in &payload.fields {
        let mut f = EmbedFieldBuilder::new(field.name.as_str(), field.value.as_str());
        if field.inline {
            f = f.inline();
        }
        builder = builder.field(f);
    }

    if let Some(next) = payload.next_update {
        builder = builder.field(EmbedFieldBuilder::new(labels::NEXT_UPDATE, format!("<t:{}:R>", next.timestamp())));
    }

    match &payload.image {
        Some(ReportImage::Attachment { filename, .. }) => {
            let source = ImageSource::attachment(filename.as_str()).map_err(|e| ChatError::Payload(e.to_string()))?;
            builder = builder.image(source);
        }
        Some(ReportImage::Url(url)) => {
            let source = ImageSource::url(url.as_str()).map_err(|e| ChatError::Payload(e.to_string()))?;
            builder = builder.image(source);
        }
        None => {}
    }

    let timestamp = Timestamp::from_secs(payload.timestamp.timestamp()).map_err(|e| ChatError::Payload(e.to_string()))?;

    builder
        .timestamp(timestamp)
        .validate()
        .map(EmbedBuilder::build)
        .map_err(|e| ChatError::Payload(e.to_string()))
}

/// Files uploaded alongside the embed.
pub fn build_attachments(payload: &ReportPayload) -> Vec<Attachment> {
    match &payload.image {
        Some(ReportImage::Attachment { filename, bytes }) => {
            vec![Attachment::from_bytes(filename.clone(), bytes.clone(), 1)]
        }
        _ => Vec::new(),
    }
}

/// [`ChatClient`] backed by the Discord REST API.
pub struct DiscordClient {
    http: Arc<HttpClient>,
}

impl DiscordClient {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChatClient for DiscordClient {
    async fn resolve_channel(&self, raw: u64) -> Result<(), ChatError> {
        let id = channel_id(raw)?;
        match self.http.channel(id).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(status_of(&e), Some(403 | 404)) => Err(ChatError::ChannelNotFound(raw)),
            Err(e) => Err(rejected(e)),
        }
    }

    async fn send_report(&self, raw: u64, payload: &ReportPayload) -> Result<MessageHandle, ChatError> {
        let id = channel_id(raw)?;
        let embeds = [build_embed(payload)?];
        let attachments = build_attachments(payload);

        let message = self
            .http
            .create_message(id)
            .embeds(&embeds)
            .attachments(&attachments)
            .await
            .map_err(rejected)?
            .model()
            .await
            .map_err(|e| ChatError::Rejected(e.to_string()))?;

        Ok(MessageHandle {
            channel_id: raw,
            message_id: message.id.get(),
        })
    }

    async fn edit_report(&self, handle: &MessageHandle, payload: &ReportPayload) -> Result<(), ChatError> {
        let channel = channel_id(handle.channel_id)?;
        let message = message_id(handle.message_id)?;
        let embeds = [build_embed(payload)?];
        let attachments = build_attachments(payload);

        // Previous chart uploads are dropped, only the new file is kept
        self.http
            .update_message(channel, message)
            .embeds(Some(&embeds))
            .keep_attachment_ids(&[])
            .attachments(&attachments)
            .await
            .map_err(rejected)?;

        Ok(())
    }
}

/// "Playing <presenceText>".
pub fn presence(config: &BotConfig) -> Result<UpdatePresencePayload, DiscordError> {
    let activity = MinimalActivity {
        kind: ActivityType::Playing,
        name: config.presence_text.clone(),
        url: None,
    };
    UpdatePresencePayload::new(vec![activity.into()], false, None::<u64>, Status::Online)
        .map_err(|e| DiscordError::Presence(e.to_string()))
}

/// Gateway connection answering the status command.
pub struct Gateway {
    http: Arc<HttpClient>,
    config: Arc<BotConfig>,
    monitor: Arc<Monitor>,
}

impl Gateway {
    pub fn new(http: Arc<HttpClient>, config: Arc<BotConfig>, monitor: Arc<Monitor>) -> Self {
        Self { http, config, monitor }
    }

    /// Run the shard until the connection is closed for good.
    pub async fn run(&self) -> Result<(), DiscordError> {
        let application_id = application_id(&self.config)?;

        let gateway_config = ConfigBuilder::new(self.config.bot_token.clone(), Intents::GUILDS)
            .presence(presence(&self.config)?)
            .build();

        let mut shard = Shard::with_config(ShardId::ONE, gateway_config);
        tracing::info!("Connecting to Discord gateway");

        while let Some(item) = shard
            .next_event(EventTypeFlags::READY | EventTypeFlags::INTERACTION_CREATE)
            .await
        {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Error receiving gateway event: {}", e);
                    continue;
                }
            };

            match event {
                Event::Ready(ready) => {
                    tracing::info!("Logged in as {} ({})", ready.user.name, ready.user.id);
                }
                Event::InteractionCreate(create) => {
                    let http = self.http.clone();
                    let config = self.config.clone();
                    let monitor = self.monitor.clone();
                    let interaction = create.0;

                    tokio::spawn(async move {
                        if let Err(e) =
                            commands::handle_interaction(&http, application_id, &config, &monitor, interaction).await
                        {
                            tracing::error!("Failed to handle interaction: {}", e);
                        }
                    });
                }
                _ => {}
            }
        }

        tracing::warn!("Discord gateway connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Color;
    use crate::report::{ReportField, CHART_FILENAME};
    use chrono::{TimeZone, Utc};

    fn payload(image: Option<ReportImage>) -> ReportPayload {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        ReportPayload {
            title: "Minecraft Server Status".to_string(),
            color: Color(0x2ecc71),
            fields: vec![
                ReportField {
                    name: labels::STATUS.to_string(),
                    value: "✅ Online".to_string(),
                    inline: true,
                },
                ReportField {
                    name: labels::MOTD.to_string(),
                    value: "hello".to_string(),
                    inline: false,
                },
            ],
            image,
            next_update: Some(now + chrono::Duration::minutes(1)),
            footer: "mcwatch".to_string(),
            timestamp: now,
        }
    }

    #[test]
    fn test_embed_fields_and_next_update() {
        let embed = tokio_test::assert_ok!(build_embed(&payload(None)));

        assert_eq!(embed.title.as_deref(), Some("Minecraft Server Status"));
        assert_eq!(embed.color, Some(0x2ecc71));
        assert_eq!(embed.fields.len(), 3);
        assert!(embed.fields[0].inline);
        assert!(!embed.fields[1].inline);
        assert_eq!(embed.fields[2].name, labels::NEXT_UPDATE);
        assert_eq!(embed.fields[2].value, "<t:1704110460:R>");
        assert_eq!(embed.footer.map(|f| f.text), Some("mcwatch".to_string()));
        assert!(embed.image.is_none());
    }

    #[test]
    fn test_chart_attachment_referenced_by_embed() {
        let p = payload(Some(ReportImage::Attachment {
            filename: CHART_FILENAME.to_string(),
            bytes: vec![1, 2, 3],
        }));

        let embed = tokio_test::assert_ok!(build_embed(&p));
        assert_eq!(
            embed.image.map(|i| i.url),
            Some(format!("attachment://{}", CHART_FILENAME))
        );

        let attachments = build_attachments(&p);
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, CHART_FILENAME);
        assert_eq!(attachments[0].file, vec![1, 2, 3]);
    }

    #[test]
    fn test_banner_url_has_no_attachment() {
        let p = payload(Some(ReportImage::Url("https://example.net/banner.png".to_string())));

        let embed = build_embed(&p).unwrap();
        assert_eq!(
            embed.image.map(|i| i.url),
            Some("https://example.net/banner.png".to_string())
        );
        assert!(build_attachments(&p).is_empty());
    }

    #[test]
    fn test_invalid_banner_url_is_payload_error() {
        let p = payload(Some(ReportImage::Url("not a url".to_string())));
        assert!(matches!(build_embed(&p), Err(ChatError::Payload(_))));
    }

    #[test]
    fn test_presence_shows_playing_text() {
        let mut cfg = BotConfig::from_json(r#"{"botToken": "t", "applicationId": 1, "targets": []}"#).unwrap();
        cfg.presence_text = "on 2 servers".to_string();

        let payload = presence(&cfg).unwrap();
        assert_eq!(payload.status, Status::Online);
        assert_eq!(payload.activities.len(), 1);
        assert_eq!(payload.activities[0].kind, ActivityType::Playing);
        assert_eq!(payload.activities[0].name, "on 2 servers");
    }

    #[test]
    fn test_zero_ids_rejected() {
        assert!(matches!(channel_id(0), Err(ChatError::InvalidId(_))));
        assert!(matches!(message_id(0), Err(ChatError::InvalidId(_))));
        assert_eq!(channel_id(42).unwrap().get(), 42);
    }
}
