//! `conclave` — a terminal hub for running multi-agent conversations.
//!
//! This binary parses CLI subcommands, bootstraps a `Hub` over a local
//! data directory, and dispatches one Controller call per invocation. The
//! optional `watch` subcommand attaches a read-only TUI observer to the
//! Event Bus instead.

use anyhow::{Context, Result};
use clap::Parser;
use conclave_core::config::HubConfig;
use conclave_core::ids::{ConversationId, ParticipantId};
use conclave_core::router::DispatchContext;
use conclave_core::types::AuthorKind;
use conclave_core::Hub;

mod cli;
mod output;
mod watch;

use cli::{AgentAction, Cli, Commands, ConfigAction};
use output::OutputFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let formatter = OutputFormatter::new();

    if let Commands::Config { action: ConfigAction::Show } = &cli.command {
        let mut config = HubConfig::load_or_default().await.context("loading configuration")?;
        if let Some(dir) = &cli.data_dir {
            config.data_dir = Some(dir.clone());
        }
        println!("{}", toml::to_string_pretty(&config).context("rendering configuration")?);
        return Ok(());
    }

    let mut config = HubConfig::load_or_default().await.context("loading configuration")?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    let hub = Hub::bootstrap(config).await.context("starting conclave hub")?;

    match cli.command {
        Commands::Create { conversation_type, participants, subject, creator } => {
            let participant_ids: Vec<ParticipantId> = participants.into_iter().map(ParticipantId::from).collect();
            match hub
                .controller
                .create_conversation(&conversation_type, participant_ids, subject, ParticipantId::from(creator))
                .await
            {
                Ok(id) => {
                    let conversation = hub.controller.get_conversation(&id).await?;
                    formatter.print_conversation_created(&conversation);
                }
                Err(e) => formatter.print_error(e.to_string()),
            }
        }

        Commands::Join { conversation_id, participant_id } => {
            let id = ConversationId::from(conversation_id);
            if let Err(e) = hub.controller.join_conversation(&id, ParticipantId::from(participant_id)).await {
                formatter.print_error(e.to_string());
            } else {
                println!("joined {}", id.as_str());
            }
        }

        Commands::Send { conversation_id, author, agent, body } => {
            let id = ConversationId::from(conversation_id);
            let author_kind = if agent { AuthorKind::Agent } else { AuthorKind::User };
            match hub
                .controller
                .send_message(&id, ParticipantId::from(author), author_kind, body, DispatchContext::default())
                .await
            {
                Ok(messages) => formatter.print_messages(&messages),
                Err(e) => formatter.print_error(e.to_string()),
            }
        }

        Commands::List => {
            let ids = hub.controller.conversations.list_ids().await;
            let mut conversations = Vec::with_capacity(ids.len());
            for id in ids {
                if let Ok(conversation) = hub.controller.get_conversation(&id).await {
                    conversations.push(conversation);
                }
            }
            formatter.print_conversation_list(&conversations);
        }

        Commands::End { conversation_id } => {
            let id = ConversationId::from(conversation_id);
            if let Err(e) = hub.controller.end_conversation(&id).await {
                formatter.print_error(e.to_string());
            } else {
                println!("ended {}", id.as_str());
            }
        }

        Commands::Agents { action: AgentAction::List } => {
            formatter.print_agents(&hub.controller.list_agents().await);
        }

        Commands::Config { action: ConfigAction::Show } => unreachable!("handled before bootstrap"),

        Commands::Watch { conversation_id } => {
            let id = ConversationId::from(conversation_id);
            watch::run(&hub, id).await.context("running watch observer")?;
        }
    }

    Ok(())
}
