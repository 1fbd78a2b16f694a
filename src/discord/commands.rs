//! The `status` slash command.

use twilight_http::Client as HttpClient;
use twilight_model::application::command::{Command, CommandType};
use twilight_model::application::interaction::application_command::{CommandData, CommandOptionValue};
use twilight_model::application::interaction::{Interaction, InteractionData};
use twilight_model::channel::message::MessageFlags;
use twilight_model::http::interaction::{InteractionResponse, InteractionResponseData, InteractionResponseType};
use twilight_model::id::marker::ApplicationMarker;
use twilight_model::id::Id;
use twilight_util::builder::command::{CommandBuilder, StringBuilder};

use super::{build_attachments, build_embed, DiscordError};
use crate::config::{BotConfig, TargetConfig};
use crate::scheduler::Monitor;

pub const STATUS_COMMAND: &str = "status";
pub const SERVER_OPTION: &str = "server";

pub fn status_command(targets: &[TargetConfig]) -> Command {
    CommandBuilder::new(
        STATUS_COMMAND,
        "Show the current status of a Minecraft server",
        CommandType::ChatInput,
    )
    .option(
        StringBuilder::new(SERVER_OPTION, "Server to check")
            .required(true)
            .choices(targets.iter().map(|t| (t.name.clone(), t.name.clone()))),
    )
    .build()
}

/// Replace the global command set with the status command.
pub async fn register_commands(
    http: &HttpClient,
    application_id: Id<ApplicationMarker>,
    config: &BotConfig,
) -> Result<(), DiscordError> {
    let commands = [status_command(&config.targets)];

    http.interaction(application_id)
        .set_global_commands(&commands)
        .await?;

    tracing::info!(
        "Registered /{} with {} server choices",
        STATUS_COMMAND,
        config.targets.len()
    );
    Ok(())
}

pub fn not_found_message(name: &str) -> String {
    format!("Server \"{}\" was not found in the configuration!", name)
}

fn requested_server(data: &CommandData) -> Option<&str> {
    data.options
        .iter()
        .find(|o| o.name == SERVER_OPTION)
        .and_then(|o| match &o.value {
            CommandOptionValue::String(s) => Some(s.as_str()),
            _ => None,
        })
}

/// Look up the target a command asked for, or the reply to send instead.
pub fn resolve_target<'a>(config: &'a BotConfig, requested: &str) -> Result<&'a TargetConfig, String> {
    config
        .find_target(requested)
        .ok_or_else(|| not_found_message(requested))
}

fn ephemeral(kind: InteractionResponseType, content: Option<String>) -> InteractionResponse {
    InteractionResponse {
        kind,
        data: Some(InteractionResponseData {
            content,
            flags: Some(MessageFlags::EPHEMERAL),
            ..Default::default()
        }),
    }
}

pub async fn handle_interaction(
    http: &HttpClient,
    application_id: Id<ApplicationMarker>,
    config: &BotConfig,
    monitor: &Monitor,
    interaction: Interaction,
) -> Result<(), DiscordError> {
    let Some(InteractionData::ApplicationCommand(data)) = &interaction.data else {
        return Ok(());
    };
    if data.name != STATUS_COMMAND {
        tracing::debug!("Ignoring unknown command /{}", data.name);
        return Ok(());
    }

    let client = http.interaction(application_id);
    let requested = requested_server(data).unwrap_or_default();

    let target = match resolve_target(config, requested) {
        Ok(target) => target,
        Err(reply) => {
            client
                .create_response(
                    interaction.id,
                    &interaction.token,
                    &ephemeral(InteractionResponseType::ChannelMessageWithSource, Some(reply)),
                )
                .await?;
            return Ok(());
        }
    };

    client
        .create_response(
            interaction.id,
            &interaction.token,
            &ephemeral(InteractionResponseType::DeferredChannelMessageWithSource, None),
        )
        .await?;

    let payload = monitor.query(target).await;
    let attachments = build_attachments(&payload);

    match build_embed(&payload) {
        Ok(embed) => {
            client
                .update_response(&interaction.token)
                .embeds(Some(&[embed]))
                .attachments(&attachments)
                .await?;
        }
        Err(e) => {
            tracing::error!("Failed to build status reply for {}: {}", target.name, e);
            client
                .update_response(&interaction.token)
                .content(Some("Could not build the status report."))
                .await?;
        }
    }

    tracing::info!("Answered /{} for {}", STATUS_COMMAND, target.name);
    Ok(())
}
