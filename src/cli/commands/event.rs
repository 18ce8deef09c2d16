//! Event CLI commands.

use clap::{Args, Subcommand};
use std::sync::Arc;

use crate::cli::commands::team::parse_id;
use crate::cli::output::{list_table, render_list, truncate};
use crate::domain::errors::CoreResult;
use crate::domain::models::{Event, EventFilter};
use crate::domain::ports::{EventQuery, EventRepository};
use crate::services::event_bus::EventBus;

#[derive(Args, Debug)]
pub struct EventArgs {
    #[command(subcommand)]
    pub command: EventCommands,
}

#[derive(Subcommand, Debug)]
pub enum EventCommands {
    /// Follow live events until interrupted
    Stream {
        /// Only these event kinds (comma separated)
        #[arg(short, long)]
        kinds: Option<String>,
    },
    /// Show recent events from the replay buffer
    List {
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
    },
    /// Replay persisted events by filter
    Replay {
        /// Event kind to match
        #[arg(short, long)]
        kind: Option<String>,
        /// Agent id to match
        #[arg(long)]
        agent: Option<String>,
        /// Team id to match
        #[arg(long)]
        team: Option<String>,
        #[arg(short = 'n', long, default_value_t = 100)]
        limit: usize,
    },
}

pub async fn handle(
    bus: &Arc<EventBus>,
    events: &Arc<dyn EventRepository>,
    command: EventCommands,
    json: bool,
) -> CoreResult<()> {
    match command {
        EventCommands::Stream { kinds } => {
            let filter = match kinds {
                Some(kinds) => EventFilter::for_kinds(kinds.split(',').map(str::trim)),
                None => EventFilter::all(),
            };
            let mut subscriber = bus.subscribe("cli-stream", filter).await;
            while let Some(event) = subscriber.recv().await {
                print_event(&event, json);
            }
        }
        EventCommands::List { limit } => {
            let recent = bus.get_recent(limit).await;
            render_events(recent, json);
        }
        EventCommands::Replay { kind, agent, team, limit } => {
            let query = EventQuery {
                kind,
                agent_id: agent.as_deref().map(parse_id).transpose()?,
                team_id: team.as_deref().map(parse_id).transpose()?,
                limit,
            };
            let mut found = events.query(query).await?;
            found.reverse(); // oldest first for replay
            render_events(found, json);
        }
    }
    Ok(())
}

fn render_events(events: Vec<Event>, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(&events).unwrap_or_default());
        return;
    }
    let mut table = list_table(&["seq", "time", "type", "source", "agent", "team"]);
    let total = events.len();
    for event in events {
        table.add_row(vec![
            event.seq.to_string(),
            event.timestamp.format("%H:%M:%S%.3f").to_string(),
            event.kind().to_string(),
            event.source.clone(),
            event.agent_id.map(|id| truncate(&id.to_string(), 9)).unwrap_or_default(),
            event.team_id.map(|id| truncate(&id.to_string(), 9)).unwrap_or_default(),
        ]);
    }
    println!("{}", render_list("event", &table, total));
}

fn print_event(event: &Event, json: bool) {
    if json {
        println!("{}", serde_json::to_string(event).unwrap_or_default());
    } else {
        println!(
            "{:>8}  {}  {:<22} {}",
            event.seq,
            event.timestamp.format("%H:%M:%S%.3f"),
            event.kind(),
            event.agent_id.map(|id| id.to_string()).unwrap_or_default(),
        );
    }
}
