// `caseroom send`: ask one question on a case and print the reply.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::debug;

use caseroom_client::config::ClientConfig;
use caseroom_client::connection::ConnectionState;
use caseroom_client::session::{spawn_session, SessionHandle, SessionSnapshot};
use caseroom_common::types::Sender;

use crate::client::{self, ConnectArgs, Endpoint};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct SendArgs {
    #[command(flatten)]
    connect: ConnectArgs,
    /// Seconds to wait for the complete reply.
    #[arg(long, default_value_t = 120)]
    wait_secs: u64,
    /// Message text.
    #[arg(required = true)]
    text: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResult {
    pub case_id: String,
    pub question: String,
    pub reply: String,
}

pub fn run(args: SendArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.connect.json);
    let question = args.text.join(" ");
    let wait = Duration::from_secs(args.wait_secs.max(1));

    let result = Endpoint::resolve(&args.connect, &ClientConfig::load()).and_then(|endpoint| {
        client::block_on(ask(endpoint, args.connect.case.clone(), question, wait))?
    });

    match result {
        Ok(result) => {
            output::print_output(format, &result, format_human)?;
            Ok(())
        }
        Err(error) => {
            output::print_anyhow_error(format, &error);
            Err(error)
        }
    }
}

async fn ask(
    endpoint: Endpoint,
    case_id: String,
    question: String,
    wait: Duration,
) -> Result<SendResult> {
    if question.trim().is_empty() {
        bail!("message text is empty");
    }
    let handle = spawn_session(endpoint.open_session(&case_id)?);
    let outcome = exchange(&handle, &question, endpoint.connect_timeout, wait).await;
    handle.shutdown().await;
    let reply = outcome?;
    Ok(SendResult { case_id, question, reply })
}

async fn exchange(
    handle: &SessionHandle,
    question: &str,
    connect_timeout: Duration,
    wait: Duration,
) -> Result<String> {
    let mut snapshots = handle.subscribe();

    // The connector enforces its own handshake timeout; allow a little slack.
    let state = timeout(
        connect_timeout + Duration::from_secs(1),
        snapshots.wait_for(|s| s.connection_state != ConnectionState::Connecting),
    )
    .await
    .map_err(|_| anyhow!("timed out connecting to the case stream"))?
    .map_err(|_| anyhow!("session stopped before connecting"))?
    .connection_state;
    if state != ConnectionState::Connected {
        bail!("could not connect to the case stream");
    }

    let baseline = snapshots.borrow().transcript.len();
    debug!(baseline, "connected, sending question");
    handle.send_message(question).await?;

    let snapshot = timeout(
        wait,
        snapshots.wait_for(|s| {
            reply_after(s, baseline).is_some() || s.connection_state != ConnectionState::Connected
        }),
    )
    .await
    .map_err(|_| anyhow!("timed out waiting for a reply"))?
    .map_err(|_| anyhow!("session stopped before the reply arrived"))?
    .clone();

    reply_after(&snapshot, baseline)
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("connection lost before the reply arrived"))
}

/// The first complete AI record after the user message at `baseline`.
fn reply_after(snapshot: &SessionSnapshot, baseline: usize) -> Option<&str> {
    snapshot
        .transcript
        .iter()
        .skip(baseline + 1)
        .find(|message| message.sender == Sender::Ai && !message.streaming)
        .map(|message| message.text.as_str())
}

fn format_human(result: &SendResult) -> String {
    result.reply.clone()
}
