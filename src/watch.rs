//! `conclave watch` — a thin, read-only terminal observer over the Event
//! Bus for one conversation. Grounded on the teacher's
//! `terminal::setup::{TerminalGuard, init_terminal}` raw-mode/alternate-
//! screen lifecycle and `tui::mod::run_event_loop`'s `tokio::select!` shape,
//! reduced to rendering rather than driving a session.

use conclave_core::event_bus::HubEvent;
use conclave_core::ids::ConversationId;
use conclave_core::Hub;
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Terminal,
};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;

const MAX_LINES: usize = 500;

/// RAII guard restoring the terminal on drop, even on panic.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
    }
}

/// Subscribes to the hub's Event Bus and renders events for `conversation_id`
/// until the user presses `q` or `Esc`. Never mutates hub state.
pub async fn run(hub: &Hub, conversation_id: ConversationId) -> io::Result<()> {
    let mut rx = hub.event_bus.subscribe("watch", Some(256), None).await;

    enable_raw_mode()?;
    execute!(io::stdout(), EnterAlternateScreen)?;
    let _guard = TerminalGuard;
    let backend = CrosstermBackend::new(io::stdout());
    let mut terminal = Terminal::new(backend)?;

    let mut lines: VecDeque<String> = VecDeque::with_capacity(MAX_LINES);
    lines.push_back(format!("watching {}", conversation_id.as_str()));

    let tick = Duration::from_millis(100);
    loop {
        terminal.draw(|f| draw(f, &conversation_id, &lines))?;

        tokio::select! {
            _ = tokio::time::sleep(tick) => {
                if event::poll(Duration::from_secs(0))? {
                    if let Event::Key(key) = event::read()? {
                        if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                            break;
                        }
                    }
                }
            }
            event = rx.recv() => {
                match event {
                    Some(hub_event) => {
                        if let Some(line) = render_if_relevant(&conversation_id, &hub_event) {
                            if lines.len() == MAX_LINES {
                                lines.pop_front();
                            }
                            lines.push_back(line);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

fn render_if_relevant(conversation_id: &ConversationId, event: &HubEvent) -> Option<String> {
    match event {
        HubEvent::Conversation(ev) if &ev.conversation_id == conversation_id => {
            Some(format!("[{}] {} {}", ev.timestamp.format("%H:%M:%S"), ev.type_tag, ev.payload))
        }
        HubEvent::Agent(ev) => Some(format!("[{}] agent:{} {} {}", ev.timestamp.format("%H:%M:%S"), ev.agent_id.as_str(), ev.type_tag, ev.payload)),
        HubEvent::File(ev) => Some(format!("[{}] file:{} {} {}", ev.timestamp.format("%H:%M:%S"), ev.file_id.as_str(), ev.type_tag, ev.payload)),
        _ => None,
    }
}

fn draw(f: &mut ratatui::Frame, conversation_id: &ConversationId, lines: &VecDeque<String>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(1)])
        .split(f.area());

    let title = Paragraph::new(Line::from(vec![Span::styled(
        format!("conclave watch — {}", conversation_id.as_str()),
        Style::default().fg(Color::Cyan),
    )]))
    .block(Block::default().borders(Borders::ALL));
    f.render_widget(title, chunks[0]);

    let items: Vec<ListItem> = lines.iter().map(|l| ListItem::new(l.as_str())).collect();
    let list = List::new(items).block(Block::default().borders(Borders::ALL).title("events (q to quit)"));
    f.render_widget(list, chunks[1]);
}
