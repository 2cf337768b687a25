//! Plain-text rendering of Controller results, grounded on the teacher's
//! `output/mod.rs::OutputFormatter` (console-styled, line-oriented printing).

use conclave_core::types::{Agent, Conversation, Message};
use console::Style;

pub struct OutputFormatter {
    heading: Style,
    dim: Style,
    ok: Style,
    err: Style,
}

impl OutputFormatter {
    pub fn new() -> Self {
        Self {
            heading: Style::new().cyan().bold(),
            dim: Style::new().dim(),
            ok: Style::new().green(),
            err: Style::new().red(),
        }
    }

    pub fn print_conversation_created(&self, conversation: &Conversation) {
        println!(
            "{} {} ({})",
            self.ok.apply_to("created"),
            self.heading.apply_to(conversation.id.as_str()),
            conversation.conversation_type
        );
    }

    pub fn print_messages(&self, messages: &[Message]) {
        if messages.is_empty() {
            println!("{}", self.dim.apply_to("(no responses)"));
            return;
        }
        for message in messages {
            println!(
                "{} {}: {}",
                self.dim.apply_to(message.timestamp.format("%H:%M:%S").to_string()),
                self.heading.apply_to(message.author_id.as_str()),
                message.body
            );
        }
    }

    pub fn print_conversation_list(&self, conversations: &[Conversation]) {
        if conversations.is_empty() {
            println!("{}", self.dim.apply_to("no conversations"));
            return;
        }
        for conversation in conversations {
            println!(
                "{:<20} {:<14} {:?}  {}",
                conversation.id.as_str(),
                conversation.conversation_type,
                conversation.state,
                conversation.subject
            );
        }
    }

    pub fn print_agents(&self, agents: &[Agent]) {
        if agents.is_empty() {
            println!("{}", self.dim.apply_to("no active agents"));
            return;
        }
        for agent in agents {
            println!(
                "{:<12} {:<14} assigned={} completed={} success_rate={:.2}",
                agent.id.as_str(),
                agent.role,
                agent.counters.tasks_assigned,
                agent.counters.tasks_completed,
                agent.counters.success_rate
            );
        }
    }

    pub fn print_error(&self, message: impl AsRef<str>) {
        eprintln!("{} {}", self.err.apply_to("error"), message.as_ref());
    }
}

impl Default for OutputFormatter {
    fn default() -> Self {
        Self::new()
    }
}
