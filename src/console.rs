use anyhow::Result;
use std::sync::Arc;
use tether_core::api::TmuxWindow;
use tether_core::client::{ConnectionEvent, ConnectionOrchestrator, ControlError};
use tether_core::types::ConnectionState;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::settings::QuickCommand;

pub const HELP: &str = "\
~.      quit
~r      reclaim the session after a takeover
~w      list tmux windows
~N      select window N
~n      new window
~x N    close window N
~c      print the visible pane
~q      list quick commands
~q N    run quick command N
~?      this help";

/// What a line typed on the console means.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `~.`
    Quit,
    /// `~r`
    Reclaim,
    ListWindows,
    SelectWindow(u32),
    NewWindow,
    CloseWindow(u32),
    CapturePane,
    ListQuickCommands,
    /// 1-based, as listed by `~q`
    RunQuickCommand(usize),
    Help,
    /// Anything else, sent to the shell followed by a carriage return.
    Input(Vec<u8>),
}

pub fn parse_line(line: &str) -> ConsoleCommand {
    let text = line.trim_end_matches(['\r', '\n']);
    match text {
        "~." => ConsoleCommand::Quit,
        "~r" => ConsoleCommand::Reclaim,
        "~w" => ConsoleCommand::ListWindows,
        "~n" => ConsoleCommand::NewWindow,
        "~c" => ConsoleCommand::CapturePane,
        "~q" => ConsoleCommand::ListQuickCommands,
        "~?" => ConsoleCommand::Help,
        _ => parse_numbered(text).unwrap_or_else(|| {
            let mut bytes = text.as_bytes().to_vec();
            bytes.push(b'\r');
            ConsoleCommand::Input(bytes)
        }),
    }
}

/// `~N`, `~x N` and `~q N`.
fn parse_numbered(text: &str) -> Option<ConsoleCommand> {
    let rest = text.strip_prefix('~')?;
    if let Some(n) = rest.strip_prefix("x ") {
        return n.trim().parse().ok().map(ConsoleCommand::CloseWindow);
    }
    if let Some(n) = rest.strip_prefix("q ") {
        return n
            .trim()
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .map(ConsoleCommand::RunQuickCommand);
    }
    if rest.bytes().all(|b| b.is_ascii_digit()) {
        return rest.parse().ok().map(ConsoleCommand::SelectWindow);
    }
    None
}

/// One status line for stderr.
pub fn describe(event: &ConnectionEvent) -> String {
    match event {
        ConnectionEvent::StatusChanged {
            state: ConnectionState::Kicked,
            kick,
            ..
        } => {
            let by = kick
                .as_ref()
                .and_then(|k| k.evicting_device.as_deref())
                .unwrap_or("another device");
            format!("[taken over by {}; type ~r to reclaim]", by)
        }
        ConnectionEvent::StatusChanged { state, .. } => {
            format!("[{}]", state.display_name().to_lowercase())
        }
        ConnectionEvent::Reconnecting { attempt, delay, .. } => {
            format!(
                "[connection lost; retry {} in {}s]",
                attempt + 1,
                delay.as_secs()
            )
        }
    }
}

pub fn format_windows(windows: &[TmuxWindow]) -> String {
    if windows.is_empty() {
        return "[no tmux windows]".to_string();
    }
    windows
        .iter()
        .map(|w| {
            let marker = if w.active { '*' } else { ' ' };
            format!("{} {}: {} ({})", marker, w.index, w.name, w.command)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_quick_commands(commands: &[QuickCommand]) -> String {
    if commands.is_empty() {
        return "[no quick commands]".to_string();
    }
    commands
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mut line = format!("{}. {}", i + 1, c.label);
            if !c.description.is_empty() {
                line.push_str(&format!(" - {}", c.description));
            }
            if c.new_window {
                line.push_str(" [new window]");
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run a control API call off the console loop and print its outcome.
fn spawn_report<F>(call: F)
where
    F: Future<Output = Result<String, ControlError>> + Send + 'static,
{
    tokio::spawn(async move {
        match call.await {
            Ok(message) if message.is_empty() => {}
            Ok(message) => eprintln!("{}", message),
            Err(e) => eprintln!("[{}]", e),
        }
    });
}

/// Bridge stdin/stdout to one connection until `~.` or end of input.
pub async fn run(
    connection: Arc<ConnectionOrchestrator>,
    events: async_channel::Receiver<ConnectionEvent>,
    quick_commands: Vec<QuickCommand>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let output = connection.output();
    let mut title = connection.subscribe_title();
    let mut title_open = true;

    connection.connect();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    log::debug!("stdin closed");
                    break;
                };
                let control = connection.control().clone();
                match parse_line(&line) {
                    ConsoleCommand::Quit => break,
                    ConsoleCommand::Reclaim => connection.reclaim(),
                    ConsoleCommand::Help => eprintln!("{}", HELP),
                    ConsoleCommand::ListWindows => spawn_report(async move {
                        control.list_windows().await.map(|w| format_windows(&w))
                    }),
                    ConsoleCommand::SelectWindow(index) => spawn_report(async move {
                        control.select_window(index).await.map(|_| String::new())
                    }),
                    ConsoleCommand::NewWindow => spawn_report(async move {
                        control.new_window(None).await.map(|_| String::new())
                    }),
                    ConsoleCommand::CloseWindow(index) => spawn_report(async move {
                        control
                            .close_window(index)
                            .await
                            .map(|_| format!("[closed window {}]", index))
                    }),
                    ConsoleCommand::CapturePane => spawn_report(async move {
                        control.capture_pane().await
                    }),
                    ConsoleCommand::ListQuickCommands => {
                        eprintln!("{}", format_quick_commands(&quick_commands));
                    }
                    ConsoleCommand::RunQuickCommand(n) => match quick_commands.get(n - 1) {
                        Some(quick) => {
                            let QuickCommand { command, new_window, .. } = quick.clone();
                            spawn_report(async move {
                                control.run_command(&command, new_window).await.map(|_| String::new())
                            });
                        }
                        None => eprintln!("[no quick command {}]", n),
                    },
                    ConsoleCommand::Input(bytes) => {
                        if connection.state() == ConnectionState::Connected {
                            connection.send_input(&bytes);
                        } else {
                            eprintln!("[{}; input dropped]", connection.state().display_name().to_lowercase());
                        }
                    }
                }
            }
            chunk = output.recv() => {
                let Ok(chunk) = chunk else { break };
                stdout.write_all(&chunk).await?;
                stdout.flush().await?;
            }
            event = events.recv() => {
                let Ok(event) = event else { break };
                if event.connection_id() == connection.id() {
                    eprintln!("{}", describe(&event));
                }
            }
            changed = title.changed(), if title_open => {
                if changed.is_err() {
                    title_open = false;
                    continue;
                }
                let current = title.borrow_and_update().clone();
                if !current.is_empty() {
                    eprintln!("[title: {}]", current);
                }
            }
        }
    }

    connection.disconnect();
    Ok(())
}
