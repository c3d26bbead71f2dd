// `caseroom watch`: follow a case live.
//
// Prints what changed on every session update (or the whole snapshot as one
// JSON line). Lines typed on stdin are sent as chat messages; `/reconnect`
// restarts the stream and `/quit` exits.

use anyhow::Result;
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use caseroom_client::config::ClientConfig;
use caseroom_client::connection::ConnectionState;
use caseroom_client::session::{spawn_session, ReadyWatermark, SessionHandle, SessionSnapshot};
use caseroom_common::types::{ChatMessage, Document, Sender};

use crate::client::{self, ConnectArgs, Endpoint};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[command(flatten)]
    connect: ConnectArgs,
}

pub fn run(args: WatchArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.connect.json);
    let result = Endpoint::resolve(&args.connect, &ClientConfig::load()).and_then(|endpoint| {
        client::block_on(watch(endpoint, args.connect.case.clone(), format))?
    });

    if let Err(error) = &result {
        output::print_anyhow_error(format, error);
    }
    result
}

async fn watch(endpoint: Endpoint, case_id: String, format: OutputFormat) -> Result<()> {
    debug!(%case_id, server = %endpoint.server_url, "watching case");
    let handle = spawn_session(endpoint.open_session(&case_id)?);
    let mut snapshots = handle.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut view = WatchView::default();

    let initial = snapshots.borrow_and_update().clone();
    view.render(format, &initial)?;

    let outcome = loop {
        let step: Result<bool> = tokio::select! {
            changed = snapshots.changed() => match changed {
                Ok(()) => {
                    let snapshot = snapshots.borrow_and_update().clone();
                    view.render(format, &snapshot).map(|()| true).map_err(Into::into)
                }
                Err(_) => Ok(false),
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => apply_input(&handle, format, Input::parse(&line)).await,
                Ok(None) => {
                    debug!("stdin closed, still watching");
                    stdin_open = false;
                    Ok(true)
                }
                Err(error) => Err(error.into()),
            },
            _ = tokio::signal::ctrl_c() => Ok(false),
        };
        match step {
            Ok(true) => continue,
            Ok(false) => break Ok(()),
            Err(error) => break Err(error),
        }
    };

    handle.shutdown().await;
    outcome
}

async fn apply_input(handle: &SessionHandle, format: OutputFormat, input: Input) -> Result<bool> {
    match input {
        Input::Blank => {}
        Input::Quit => return Ok(false),
        Input::Reconnect => handle.reconnect().await?,
        Input::Chat(text) => {
            let state = handle.snapshot().connection_state;
            if state != ConnectionState::Connected {
                output::print_warning(
                    format,
                    "NOT_CONNECTED",
                    &format!("stream is {state}; message not sent (type /reconnect)"),
                );
                return Ok(true);
            }
            handle.send_message(text).await?;
        }
    }
    Ok(true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Blank,
    Quit,
    Reconnect,
    Chat(String),
}

impl Input {
    fn parse(line: &str) -> Self {
        match line.trim() {
            "" => Self::Blank,
            "/quit" | "/exit" => Self::Quit,
            "/reconnect" => Self::Reconnect,
            text => Self::Chat(text.to_string()),
        }
    }
}

// ── Rendering ──────────────────────────────────────────────────────

/// Remembers the last snapshot so human output only shows what changed.
#[derive(Default)]
struct WatchView {
    last: Option<SessionSnapshot>,
    watermark: ReadyWatermark,
}

impl WatchView {
    fn render(&mut self, format: OutputFormat, snapshot: &SessionSnapshot) -> std::io::Result<()> {
        let lines = self.update(snapshot);
        output::print_output(format, snapshot, |_| lines.join("\n"))
    }

    fn update(&mut self, next: &SessionSnapshot) -> Vec<String> {
        let mut lines = Vec::new();
        let prev = self.last.as_ref();

        if prev.map(|p| p.connection_state) != Some(next.connection_state) {
            let case = next.case_id.as_deref().unwrap_or("-");
            lines.push(format!("[{}] case {case} (epoch {})", next.connection_state, next.epoch));
        }

        let prev_docs = prev.map(|p| p.documents.as_slice()).unwrap_or_default();
        for doc in &next.documents {
            if prev_docs.iter().find(|old| old.id == doc.id) != Some(doc) {
                lines.push(describe_document(doc));
            }
        }
        for old in prev_docs {
            if !next.documents.iter().any(|doc| doc.id == old.id) {
                lines.push(format!("document {} removed", old.id));
            }
        }

        // Streaming replies are shown once they are final.
        let prev_messages = prev.map(|p| p.transcript.as_slice()).unwrap_or_default();
        for (index, message) in next.transcript.iter().enumerate() {
            if !message.streaming && prev_messages.get(index) != Some(message) {
                lines.push(describe_message(message));
            }
        }

        if self.watermark.observe(next) {
            lines.push(format!("{} document(s) ready", next.ready_document_count()));
        }

        self.last = Some(next.clone());
        lines
    }
}

fn describe_document(doc: &Document) -> String {
    let name = if doc.file_name.is_empty() { "(unnamed)" } else { doc.file_name.as_str() };
    format!("document {} {name}: {}", doc.id, doc.status)
}

fn describe_message(message: &ChatMessage) -> String {
    let who = match message.sender {
        Sender::User => "you",
        Sender::Ai => "ai",
    };
    format!("{} {who}: {}", message.timestamp.format("%H:%M"), message.text)
}
