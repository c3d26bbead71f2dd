// Synchronization session: the composition root.
//
// Owns the document collection, the transcript, the send gate and the
// connection manager for one case-viewing session. All mutation goes through
// the reducers in `reconcile`; every change is republished as a
// `SessionSnapshot` on a watch channel.

use std::mem;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use caseroom_common::protocol::codec::{decode_frame, encode_outbound, Decoded};
use caseroom_common::protocol::frames::{InboundEvent, OutboundFrame};
use caseroom_common::types::{ChatMessage, Document};

use crate::connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, Connector, Epoch, SignalReceiver,
    TaggedSignal,
};
use crate::credentials::{AddressResolver, CredentialProvider};
use crate::reconcile::{documents, transcript};

const COMMAND_BUFFER_SIZE: usize = 64;

/// Everything a consumer can observe about a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub case_id: Option<String>,
    pub epoch: Epoch,
    pub connection_state: ConnectionState,
    /// A user message is outstanding and no reply has started yet.
    pub send_gate: bool,
    pub documents: Vec<Document>,
    pub transcript: Vec<ChatMessage>,
}

impl SessionSnapshot {
    fn empty() -> Self {
        Self {
            case_id: None,
            epoch: Epoch::default(),
            connection_state: ConnectionState::Disconnected,
            send_gate: false,
            documents: Vec::new(),
            transcript: Vec::new(),
        }
    }

    /// Documents in `READY` or `COMPLETED` state.
    pub fn ready_document_count(&self) -> usize {
        documents::ready_count(&self.documents)
    }
}

/// Fires when the number of ready documents goes up.
///
/// Consumers that derive richer data from processed documents (findings, the
/// relationship graph) poll this on each snapshot to decide when to refetch.
#[derive(Debug, Clone, Default)]
pub struct ReadyWatermark {
    last: usize,
}

impl ReadyWatermark {
    pub fn observe(&mut self, snapshot: &SessionSnapshot) -> bool {
        let count = snapshot.ready_document_count();
        let increased = count > self.last;
        self.last = count;
        increased
    }
}

pub struct Session<C: Connector> {
    connection: ConnectionManager<C>,
    signals: SignalReceiver,
    documents: Vec<Document>,
    transcript: Vec<ChatMessage>,
    send_gate: bool,
    published: watch::Sender<SessionSnapshot>,
}

impl<C: Connector> Session<C> {
    /// Create a session and, if a case id is given and a credential is
    /// available, start connecting right away.
    pub fn new(
        connector: C,
        resolver: impl AddressResolver + 'static,
        credentials: impl CredentialProvider + 'static,
        case_id: Option<String>,
    ) -> Self {
        let (connection, signals) =
            ConnectionManager::new(connector, Box::new(resolver), Box::new(credentials));
        let (published, _) = watch::channel(SessionSnapshot::empty());
        let mut session = Self {
            connection,
            signals,
            documents: Vec::new(),
            transcript: Vec::new(),
            send_gate: false,
            published,
        };
        session.connection.set_case(case_id);
        session.publish();
        session
    }

    // ── Observation ─────────────────────────────────────────────────

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.published.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            case_id: self.connection.case_id().map(str::to_owned),
            epoch: self.connection.epoch(),
            connection_state: self.connection.state(),
            send_gate: self.send_gate,
            documents: self.documents.clone(),
            transcript: self.transcript.clone(),
        }
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn send_gate(&self) -> bool {
        self.send_gate
    }

    pub fn epoch(&self) -> Epoch {
        self.connection.epoch()
    }

    pub fn connector(&self) -> &C {
        self.connection.connector()
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Send a chat message. Returns whether it went out.
    ///
    /// Rejected (and logged) when the text is blank or the stream is not
    /// connected. On success the message is appended to the transcript
    /// before the server has seen it and the send gate is raised.
    pub fn send_message(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            debug!("ignoring blank chat message");
            return false;
        }
        let state = self.connection.state();
        if state != ConnectionState::Connected {
            debug!(%state, "ignoring chat message while not connected");
            return false;
        }

        let frame = match encode_outbound(&OutboundFrame::chat_message(text)) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "failed to encode chat message");
                return false;
            }
        };
        if let Err(error) = self.connection.send_frame(frame) {
            warn!(%error, "chat message not sent");
            self.abandon_reply();
            self.publish();
            return false;
        }

        let now = Utc::now();
        self.transcript = transcript::append_user(mem::take(&mut self.transcript), text, now);
        self.send_gate = true;
        self.publish();
        true
    }

    /// Drop the current connection and try again under a new epoch.
    pub fn reconnect(&mut self) {
        self.connection.reconnect();
        self.abandon_reply();
        self.publish();
    }

    /// Point the session at another case. Documents and transcript belong to
    /// the previous case and are cleared.
    pub fn set_case(&mut self, case_id: Option<String>) {
        if self.connection.set_case(case_id) {
            self.documents.clear();
            self.transcript.clear();
            self.send_gate = false;
        }
        self.publish();
    }

    /// The credential source may have changed; reconnect if it did.
    pub fn credentials_changed(&mut self) {
        if self.connection.refresh_credential() {
            self.abandon_reply();
        }
        self.publish();
    }

    /// Seed documents from an out-of-band full fetch. Safe to call after
    /// streaming has started: entries are de-duplicated by id.
    pub fn hydrate_documents(&mut self, fetched: Vec<Document>) {
        self.documents = documents::hydrate(mem::take(&mut self.documents), fetched, Utc::now());
        self.publish();
    }

    /// Replace the transcript with one fetched out of band.
    pub fn hydrate_transcript(&mut self, fetched: Vec<ChatMessage>) {
        self.transcript = transcript::hydrate(fetched);
        self.publish();
    }

    /// Tear the connection down. The session can be revived with
    /// `reconnect`.
    pub fn shutdown(&mut self) {
        self.connection.teardown();
        self.abandon_reply();
        self.publish();
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Apply one transport signal. Signals from superseded connections are
    /// dropped without touching state.
    pub fn handle_signal(&mut self, tagged: TaggedSignal) {
        let Some(event) = self.connection.handle_signal(tagged) else {
            return;
        };
        match event {
            ConnectionEvent::Connected => {}
            ConnectionEvent::Frame(raw) => self.apply_frame(&raw),
            ConnectionEvent::Lost { .. } => self.abandon_reply(),
        }
        self.publish();
    }

    /// Apply every signal that is already queued, in arrival order.
    pub fn drain_signals(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(tagged) = self.signals.try_recv() {
            self.handle_signal(tagged);
            applied += 1;
        }
        applied
    }

    fn apply_frame(&mut self, raw: &str) {
        match decode_frame(raw) {
            Ok(Decoded::Event(event)) => self.apply_event(event),
            Ok(Decoded::Ignored { kind }) => debug!(%kind, "ignoring unknown event type"),
            Err(error) => warn!(%error, "discarding malformed frame"),
        }
    }

    fn apply_event(&mut self, event: InboundEvent) {
        let now = Utc::now();
        match event {
            InboundEvent::Chat(chat) => {
                self.transcript = transcript::assemble(mem::take(&mut self.transcript), chat, now);
                self.send_gate = false;
            }
            InboundEvent::Document(update) => {
                self.documents = documents::reconcile(mem::take(&mut self.documents), update, now);
            }
        }
    }

    /// The connection carrying the current reply is gone: no reply is
    /// pending and a partial one is final as it stands.
    fn abandon_reply(&mut self) {
        self.send_gate = false;
        self.transcript = transcript::finalize_tail(mem::take(&mut self.transcript));
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.published.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    // ── Actor mode ──────────────────────────────────────────────────

    /// Process commands and transport signals until the command channel
    /// closes or `Shutdown` arrives, then tear the connection down.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.apply_command(command),
                },
                Some(tagged) = self.signals.recv() => self.handle_signal(tagged),
            }
        }
        self.shutdown();
    }

    fn apply_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SendMessage(text) => {
                self.send_message(&text);
            }
            SessionCommand::Reconnect => self.reconnect(),
            SessionCommand::SetCase(case_id) => self.set_case(case_id),
            SessionCommand::CredentialsChanged => self.credentials_changed(),
            SessionCommand::HydrateDocuments(fetched) => self.hydrate_documents(fetched),
            SessionCommand::HydrateTranscript(fetched) => self.hydrate_transcript(fetched),
            SessionCommand::Shutdown => self.shutdown(),
        }
    }
}

/// Requests a consumer can make of a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    SendMessage(String),
    Reconnect,
    SetCase(Option<String>),
    CredentialsChanged,
    HydrateDocuments(Vec<Document>),
    HydrateTranscript(Vec<ChatMessage>),
    Shutdown,
}

/// Consumer side of a session running on its own task.
///
/// Dropping the handle stops the task and tears the connection down.
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

/// Move a session onto a tokio task.
pub fn spawn_session<C>(session: Session<C>) -> SessionHandle
where
    C: Connector + 'static,
{
    let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
    let snapshots = session.subscribe();
    let task = tokio::spawn(session.run(commands_rx));
    SessionHandle { commands, snapshots, task }
}

impl SessionHandle {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<()> {
        self.command(SessionCommand::SendMessage(text.into())).await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.command(SessionCommand::Reconnect).await
    }

    pub async fn set_case(&self, case_id: Option<String>) -> Result<()> {
        self.command(SessionCommand::SetCase(case_id)).await
    }

    pub async fn credentials_changed(&self) -> Result<()> {
        self.command(SessionCommand::CredentialsChanged).await
    }

    pub async fn hydrate_documents(&self, fetched: Vec<Document>) -> Result<()> {
        self.command(SessionCommand::HydrateDocuments(fetched)).await
    }

    pub async fn hydrate_transcript(&self, fetched: Vec<ChatMessage>) -> Result<()> {
        self.command(SessionCommand::HydrateTranscript(fetched)).await
    }

    /// Stop the session task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
        let _ = self.task.await;
    }

    async fn command(&self, command: SessionCommand) -> Result<()> {
        self.commands.send(command).await.map_err(|_| anyhow!("session task has stopped"))
    }
}
