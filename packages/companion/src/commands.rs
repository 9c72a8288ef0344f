use anyhow::{Context, Result, bail};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use companion_core::{
    ConnectionManager, ConnectionState, ConnectionStatus, ConversationSync, ConversationView,
    Highlight, Role, SendOutcome, SessionCache, SessionGuard,
};

use crate::AppContext;

const POLL_STEP: Duration = Duration::from_millis(50);

/// Poll `done` until it holds or `wait` elapses.
async fn wait_until(wait: Duration, done: impl Fn() -> bool) -> bool {
    tokio::time::timeout(wait, async {
        while !done() {
            tokio::time::sleep(POLL_STEP).await;
        }
    })
    .await
    .is_ok()
}

fn settled(manager: &ConnectionManager) -> bool {
    manager.states().iter().all(|(_, s)| {
        matches!(
            s.status,
            ConnectionStatus::Connected | ConnectionStatus::Error
        )
    })
}

fn describe(state: &ConnectionState) -> String {
    match state.status {
        ConnectionStatus::Reconnecting => format!("attempt {}", state.reconnect_attempts),
        ConnectionStatus::Connected => state
            .last_connected_at
            .map(|t| format!("since {}", t.with_timezone(&chrono::Local).format("%H:%M:%S")))
            .unwrap_or_default(),
        _ => state.error.clone().unwrap_or_default(),
    }
}

pub async fn status_command(ctx: &AppContext, wait: Duration, json: bool) -> Result<()> {
    let enabled: Vec<_> = ctx.servers.iter().filter(|s| s.enabled).collect();
    if enabled.is_empty() {
        println!(
            "No enabled servers. Add a [[servers]] entry to {}",
            ctx.dirs.config_toml_path().display()
        );
        return Ok(());
    }

    let manager = ConnectionManager::new(ctx.connection.clone(), Some(ctx.queue.clone()));
    manager.sync_servers(&ctx.servers);
    if !wait_until(wait, || settled(&manager)).await {
        info!("Some servers did not settle within {}s", wait.as_secs());
    }
    let states = manager.states();
    manager.shutdown();

    if json {
        let rows: Vec<_> = states
            .iter()
            .map(|(id, state)| {
                serde_json::json!({
                    "id": id,
                    "name": ctx.find_server(id).ok().map(|s| s.display_name().to_string()),
                    "status": state.status.to_string(),
                    "error": state.error,
                    "reconnectAttempts": state.reconnect_attempts,
                    "lastConnectedAt": state.last_connected_at.map(|t| t.to_rfc3339()),
                    "queued": ctx.queue.messages_for(id).len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{:<16} {:<20} {:<14} {:<7} {}",
        "SERVER", "NAME", "STATUS", "QUEUED", "DETAIL"
    );
    println!("{}", "-".repeat(80));
    for (id, state) in &states {
        let name = ctx
            .find_server(id)
            .map(|s| s.display_name().to_string())
            .unwrap_or_default();
        println!(
            "{:<16} {:<20} {:<14} {:<7} {}",
            id,
            name,
            state.status,
            ctx.queue.messages_for(id).len(),
            describe(state)
        );
    }
    Ok(())
}

fn print_highlight(h: &Highlight) {
    let at = chrono::DateTime::from_timestamp_millis(h.timestamp)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_default();
    let who = match h.role {
        Role::User => "you",
        Role::Assistant => "agent",
    };
    println!("[{at}] {who}: {}", h.content);
    for tool in h.tool_calls.iter().flatten() {
        println!("         -> {} {}", tool.name, tool.status.as_deref().unwrap_or(""));
    }
    for (i, option) in h.options.iter().flatten().enumerate() {
        println!("         {}. {}", i + 1, option.label);
    }
}

/// Prints each confirmed entry once, plus activity and error changes.
#[derive(Default)]
struct Printer {
    seen: HashSet<String>,
    activity: Option<String>,
    error: Option<String>,
}

impl Printer {
    fn render(&mut self, view: &ConversationView) {
        for h in view.highlights.iter().filter(|h| !h.is_optimistic()) {
            if self.seen.insert(h.id.clone()) {
                print_highlight(h);
            }
        }
        let activity = view.status.as_ref().and_then(|s| s.current_activity.clone());
        if activity != self.activity {
            if let Some(a) = &activity {
                eprintln!("[{a}]");
            }
            self.activity = activity;
        }
        if view.error != self.error {
            if let Some(e) = &view.error {
                eprintln!("[error: {e}]");
            }
            self.error = view.error.clone();
        }
    }
}

pub async fn watch_command(ctx: &AppContext, server_id: &str, session_id: &str) -> Result<()> {
    let server = ctx.find_server(server_id)?;
    if !server.enabled {
        bail!("Server '{server_id}' is disabled");
    }

    let manager = ConnectionManager::new(ctx.connection.clone(), Some(ctx.queue.clone()));
    manager.sync_servers(std::slice::from_ref(&server));
    manager.set_active(Some(server_id));

    let _states = manager.on_state_change(|id, state| {
        eprintln!("[{id}: {}]", state.status);
    });

    let connection = manager
        .get_connection(server_id)
        .context("Server was not added to the pool")?;
    let ready = wait_until(ctx.connection.connect_timeout, || {
        connection.is_connected() || connection.state().status == ConnectionStatus::Error
    })
    .await;
    if !ready {
        warn!("Still connecting to {}; input will be queued", server.display_name());
    }

    let sync = ConversationSync::new(
        manager.clone(),
        SessionGuard::new(),
        SessionCache::new(ctx.sync.cache_ttl),
        Some(ctx.queue.clone()),
        ctx.sync.clone(),
    );
    let printer = Arc::new(Mutex::new(Printer::default()));
    let _view = {
        let printer = printer.clone();
        sync.subscribe(move |view| {
            if let Ok(mut p) = printer.lock() {
                p.render(view);
            }
        })
    };

    if let Err(e) = sync.enter_session(server_id, session_id).await {
        warn!("Initial load failed: {e}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                match sync.send_or_enqueue(text).await {
                    Ok(SendOutcome::Sent(_)) => {}
                    Ok(SendOutcome::Queued(message)) => {
                        eprintln!("[queued {}]", message.id);
                    }
                    Err(e) => eprintln!("[send failed: {e}]"),
                }
            }
        }
    }

    sync.leave();
    manager.shutdown();
    Ok(())
}

pub fn queue_list(ctx: &AppContext, server_id: Option<&str>, json: bool) -> Result<()> {
    let messages = match server_id {
        Some(id) => ctx.queue.messages_for(id),
        None => ctx.queue.messages(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
    } else if messages.is_empty() {
        println!("No queued messages.");
    } else {
        println!("{:<38} {:<16} {:<12} {}", "ID", "SERVER", "SESSION", "TEXT");
        println!("{}", "-".repeat(100));
        for m in &messages {
            println!(
                "{:<38} {:<16} {:<12} {}",
                m.id,
                m.server_id,
                m.session_id.as_deref().unwrap_or("-"),
                m.text
            );
        }
        println!("\n{} message(s)", messages.len());
    }
    Ok(())
}

pub fn queue_add(
    ctx: &AppContext,
    server_id: &str,
    text: &str,
    session_id: Option<&str>,
) -> Result<()> {
    ctx.find_server(server_id)?;
    let message = match session_id {
        Some(session) => ctx.queue.enqueue_for_session(server_id, session, text)?,
        None => ctx.queue.enqueue(server_id, text)?,
    };
    println!("{}", message.id);
    Ok(())
}

pub fn queue_edit(ctx: &AppContext, id: &str, text: &str) -> Result<()> {
    if !ctx.queue.edit(id, text)? {
        bail!("No queued message {id}");
    }
    Ok(())
}

pub fn queue_cancel(ctx: &AppContext, id: &str) -> Result<()> {
    if !ctx.queue.cancel(id)? {
        bail!("No queued message {id}");
    }
    Ok(())
}

pub fn queue_clear(ctx: &AppContext, server_id: &str) -> Result<()> {
    let removed = ctx.queue.clear_all(server_id)?;
    println!("Removed {removed} message(s)");
    Ok(())
}

/// Delivery itself happens in the connection's post-auth drain; this just
/// connects and waits for the server's backlog to empty.
pub async fn queue_flush(ctx: &AppContext, server_id: &str, wait: Duration) -> Result<()> {
    let server = ctx.find_server(server_id)?;
    let before = ctx.queue.messages_for(server_id).len();
    if before == 0 {
        println!("Nothing queued for {server_id}");
        return Ok(());
    }

    let manager = ConnectionManager::new(ctx.connection.clone(), Some(ctx.queue.clone()));
    manager.sync_servers(std::slice::from_ref(&server));
    wait_until(wait, || ctx.queue.messages_for(server_id).is_empty()).await;
    let state = manager
        .get_connection(server_id)
        .map(|c| c.state())
        .unwrap_or_default();
    manager.shutdown();

    let remaining = ctx.queue.messages_for(server_id).len();
    println!("Delivered {}, {remaining} remaining", before.saturating_sub(remaining));
    if remaining > 0 {
        if let Some(error) = state.error {
            bail!("{}: {error}", server.display_name());
        }
    }
    Ok(())
}
