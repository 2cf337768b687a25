//! Command-line surface (§6): `clap` derive parser with one subcommand per
//! Controller intent, plus the optional read-only `watch` TUI observer.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "conclave")]
#[command(about = "Terminal hub for running multi-agent conversations")]
#[command(version)]
pub struct Cli {
    /// Overrides the resolved data directory (conversations, journal, files).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Starts a new conversation.
    Create {
        /// Conversation type tag, e.g. "democratic", "hierarchical", "debate".
        #[arg(long = "type")]
        conversation_type: String,
        /// Participant ids (agents and/or users), comma-separated.
        #[arg(long, value_delimiter = ',')]
        participants: Vec<String>,
        #[arg(long)]
        subject: String,
        /// Id of the participant creating the conversation.
        #[arg(long)]
        creator: String,
    },
    /// Adds a participant to an existing conversation.
    Join {
        conversation_id: String,
        participant_id: String,
    },
    /// Posts a message and prints whatever agent responses it produces.
    Send {
        conversation_id: String,
        #[arg(long)]
        author: String,
        /// Treated as a user author unless `--agent` is set.
        #[arg(long)]
        agent: bool,
        body: String,
    },
    /// Lists known conversations.
    List,
    /// Ends a conversation.
    End { conversation_id: String },
    /// Agent registry operations.
    Agents {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Configuration operations.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Opens a read-only terminal observer for a conversation's event stream.
    Watch { conversation_id: String },
}

#[derive(Subcommand)]
pub enum AgentAction {
    /// Lists active agents and their performance counters.
    List,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Prints the resolved configuration.
    Show,
}
