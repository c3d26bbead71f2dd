// Connection lifecycle manager for the case event stream.
//
// Owns the DISCONNECTED -> CONNECTING -> CONNECTED state machine. There is
// no automatic retry: a new attempt happens only when the case, the
// credential or the reconnect epoch changes.
//
// Every attempt gets a fresh `Epoch`. The transport tags each signal with
// the epoch of the connection that produced it, and signals from anything
// but the live connection are dropped before they can reach session state.
//
// Transport is abstracted via `Connector` for testability; the websocket
// implementation lives in `ws`.

pub mod ws;

use std::fmt;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::credentials::{AddressResolver, CredentialProvider};

// ── State ───────────────────────────────────────────────────────────

/// Current state of the stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// Identifies one connection attempt. Strictly increasing per manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct Epoch(u64);

impl Epoch {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Transport trait ─────────────────────────────────────────────────

/// What a connection reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    Opened,
    Frame(String),
    Closed { reason: String },
    Error { message: String },
}

/// A transport signal stamped with the epoch of the connection that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedSignal {
    pub epoch: Epoch,
    pub signal: TransportSignal,
}

pub type SignalSender = mpsc::UnboundedSender<TaggedSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<TaggedSignal>;

/// Handle to one open (or opening) connection.
pub trait Connection: Send {
    /// Queue a text frame for sending.
    fn send(&mut self, frame: String) -> Result<()>;

    /// Stop delivering signals. Always called before `close`.
    fn detach(&mut self);

    /// Close the underlying transport. Must be idempotent.
    fn close(&mut self);
}

/// Opens connections.
///
/// `open` must return without waiting for the handshake; progress is
/// reported through `signals`, tagged with `epoch`.
pub trait Connector: Send {
    type Conn: Connection;

    fn open(&mut self, address: &Url, epoch: Epoch, signals: SignalSender) -> Result<Self::Conn>;
}

// ── Connection events ───────────────────────────────────────────────

/// What an accepted signal means for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Frame(String),
    Lost { reason: String },
}

// ── Connection manager ──────────────────────────────────────────────

/// Manages the stream connection lifecycle for one session.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    resolver: Box<dyn AddressResolver>,
    credentials: Box<dyn CredentialProvider>,
    signals: SignalSender,
    state: ConnectionState,
    epoch: Epoch,
    case_id: Option<String>,
    credential: Option<String>,
    active: Option<C::Conn>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Build a manager. The returned receiver carries every signal from every
    /// connection this manager opens; feed it back through `handle_signal`.
    pub fn new(
        connector: C,
        resolver: Box<dyn AddressResolver>,
        credentials: Box<dyn CredentialProvider>,
    ) -> (Self, SignalReceiver) {
        let (signals, receiver) = mpsc::unbounded_channel();
        let manager = Self {
            connector,
            resolver,
            credentials,
            signals,
            state: ConnectionState::Disconnected,
            epoch: Epoch::default(),
            case_id: None,
            credential: None,
            active: None,
        };
        (manager, receiver)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn case_id(&self) -> Option<&str> {
        self.case_id.as_deref()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }

    /// Switch to another case (or none). Returns whether the case changed;
    /// a change tears down the current connection and tries a fresh one.
    pub fn set_case(&mut self, case_id: Option<String>) -> bool {
        let case_id = case_id.filter(|id| !id.trim().is_empty());
        if case_id == self.case_id {
            return false;
        }
        info!(from = ?self.case_id, to = ?case_id, "case changed");
        self.case_id = case_id;
        self.restart();
        true
    }

    /// Re-read the credential provider. Returns whether the credential
    /// changed; a change tears down and reconnects.
    pub fn refresh_credential(&mut self) -> bool {
        let credential = self.credentials.credential();
        if credential == self.credential {
            return false;
        }
        info!(present = credential.is_some(), "credential changed");
        self.restart();
        true
    }

    /// Manual reconnect: bump the epoch and start over.
    pub fn reconnect(&mut self) {
        info!(epoch = %self.epoch, "manual reconnect requested");
        self.restart();
    }

    /// Tear down whatever is live and attempt a fresh connection under a new
    /// epoch.
    fn restart(&mut self) {
        self.teardown();
        self.epoch = self.epoch.next();
        self.credential = self.credentials.credential();
        self.try_connect();
    }

    fn try_connect(&mut self) {
        let (Some(case_id), Some(credential)) =
            (self.case_id.as_deref(), self.credential.as_deref())
        else {
            debug!(
                epoch = %self.epoch,
                has_case = self.case_id.is_some(),
                has_credential = self.credential.is_some(),
                "connection preconditions not met, staying disconnected"
            );
            return;
        };

        let address = match self.resolver.resolve(case_id, credential) {
            Ok(address) => address,
            Err(error) => {
                warn!(epoch = %self.epoch, case_id, %error, "could not resolve stream address");
                return;
            }
        };

        self.state = ConnectionState::Connecting;
        info!(epoch = %self.epoch, case_id, "connecting to case stream");
        match self.connector.open(&address, self.epoch, self.signals.clone()) {
            Ok(connection) => self.active = Some(connection),
            Err(error) => {
                warn!(epoch = %self.epoch, case_id, %error, "failed to open connection");
                self.state = ConnectionState::Disconnected;
            }
        }
    }

    /// Translate a transport signal. Returns `None` for signals from a
    /// superseded or already torn-down connection.
    pub fn handle_signal(&mut self, tagged: TaggedSignal) -> Option<ConnectionEvent> {
        if tagged.epoch != self.epoch || self.active.is_none() {
            debug!(
                epoch = %tagged.epoch,
                current = %self.epoch,
                "discarding signal from stale connection"
            );
            return None;
        }

        match tagged.signal {
            TransportSignal::Opened => {
                self.state = ConnectionState::Connected;
                info!(epoch = %self.epoch, "case stream connected");
                Some(ConnectionEvent::Connected)
            }
            TransportSignal::Frame(frame) => Some(ConnectionEvent::Frame(frame)),
            TransportSignal::Closed { reason } => {
                info!(epoch = %self.epoch, %reason, "case stream closed");
                self.teardown();
                Some(ConnectionEvent::Lost { reason })
            }
            TransportSignal::Error { message } => {
                warn!(epoch = %self.epoch, %message, "case stream transport error");
                self.teardown();
                Some(ConnectionEvent::Lost { reason: message })
            }
        }
    }

    /// Send a text frame on the live connection.
    ///
    /// A failed write is a transport failure: the connection is torn down.
    pub fn send_frame(&mut self, frame: String) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(anyhow!("cannot send: not connected"));
        }
        let Some(connection) = self.active.as_mut() else {
            return Err(anyhow!("cannot send: no live connection"));
        };
        if let Err(error) = connection.send(frame) {
            warn!(epoch = %self.epoch, %error, "send failed, dropping connection");
            self.teardown();
            return Err(error);
        }
        Ok(())
    }

    /// Detach, then close, the live connection (if any).
    pub fn teardown(&mut self) {
        if let Some(mut connection) = self.active.take() {
            connection.detach();
            connection.close();
            debug!(epoch = %self.epoch, "connection torn down");
        }
        self.state = ConnectionState::Disconnected;
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        self.teardown();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Call, MockConnector};
    use super::*;
    use crate::credentials::{StaticCredential, UrlTemplateResolver};

    fn manager_with(
        credential: StaticCredential,
    ) -> (ConnectionManager<MockConnector>, SignalReceiver, MockConnector) {
        let connector = MockConnector::default();
        let resolver = UrlTemplateResolver::new("wss://cases.test").unwrap();
        let (mgr, rx) =
            ConnectionManager::new(connector.clone(), Box::new(resolver), Box::new(credential));
        (mgr, rx, connector)
    }

    fn connected_manager() -> (ConnectionManager<MockConnector>, SignalReceiver, MockConnector) {
        let (mut mgr, mut rx, connector) = manager_with(StaticCredential::new("tok"));
        mgr.set_case(Some("case-1".into()));
        connector.emit(mgr.epoch(), TransportSignal::Opened);
        let signal = rx.try_recv().unwrap();
        assert_eq!(mgr.handle_signal(signal), Some(ConnectionEvent::Connected));
        (mgr, rx, connector)
    }

    // ── Preconditions ───────────────────────────────────────────────

    #[test]
    fn starts_disconnected() {
        let (mgr, _rx, connector) = manager_with(StaticCredential::new("tok"));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(connector.opens(), 0);
    }

    #[test]
    fn missing_credential_stays_disconnected() {
        let (mut mgr, _rx, connector) = manager_with(StaticCredential::none());
        assert!(mgr.set_case(Some("case-1".into())));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(connector.opens(), 0);
    }

    #[test]
    fn blank_case_id_stays_disconnected() {
        let (mut mgr, _rx, connector) = manager_with(StaticCredential::new("tok"));
        assert!(!mgr.set_case(Some("   ".into())));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(connector.opens(), 0);
    }

    #[test]
    fn unresolvable_address_stays_disconnected() {
        let (mut mgr, _rx, connector) = manager_with(StaticCredential::new("tok"));
        mgr.set_case(Some("bad/case".into()));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(connector.opens(), 0);
    }

    #[test]
    fn open_failure_returns_to_disconnected() {
        let (mut mgr, _rx, connector) = manager_with(StaticCredential::new("tok"));
        connector.journal.lock().unwrap().fail_open = true;
        mgr.set_case(Some("case-1".into()));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    #[test]
    fn connect_happy_path() {
        let (mut mgr, mut rx, connector) = manager_with(StaticCredential::new("tok"));
        mgr.set_case(Some("case-1".into()));
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        assert_eq!(
            connector.calls(),
            vec![Call::Open {
                address: "wss://cases.test/ws/cases/case-1?token=tok".into(),
                epoch: Epoch::new(1),
            }]
        );

        connector.emit(Epoch::new(1), TransportSignal::Opened);
        let event = mgr.handle_signal(rx.try_recv().unwrap());
        assert_eq!(event, Some(ConnectionEvent::Connected));
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[test]
    fn same_case_does_not_reconnect() {
        let (mut mgr, _rx, connector) = connected_manager();
        assert!(!mgr.set_case(Some("case-1".into())));
        assert_eq!(connector.opens(), 1);
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[test]
    fn frames_pass_through_when_current() {
        let (mut mgr, mut rx, connector) = connected_manager();
        connector.emit(mgr.epoch(), TransportSignal::Frame("{}".into()));
        let event = mgr.handle_signal(rx.try_recv().unwrap());
        assert_eq!(event, Some(ConnectionEvent::Frame("{}".into())));
    }

    #[test]
    fn close_sets_disconnected() {
        let (mut mgr, mut rx, connector) = connected_manager();
        connector.emit(mgr.epoch(), TransportSignal::Closed { reason: "bye".into() });
        let event = mgr.handle_signal(rx.try_recv().unwrap());
        assert_eq!(event, Some(ConnectionEvent::Lost { reason: "bye".into() }));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn transport_error_detaches_then_closes() {
        let (mut mgr, mut rx, connector) = connected_manager();
        let epoch = mgr.epoch();
        connector.emit(epoch, TransportSignal::Error { message: "reset".into() });
        mgr.handle_signal(rx.try_recv().unwrap());

        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        let calls = connector.calls();
        assert_eq!(&calls[calls.len() - 2..], &[Call::Detach { epoch }, Call::Close { epoch }]);
    }

    #[test]
    fn no_automatic_retry_after_loss() {
        let (mut mgr, mut rx, connector) = connected_manager();
        connector.emit(mgr.epoch(), TransportSignal::Closed { reason: "gone".into() });
        mgr.handle_signal(rx.try_recv().unwrap());
        assert_eq!(connector.opens(), 1);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn frames_after_close_are_discarded() {
        let (mut mgr, mut rx, connector) = connected_manager();
        let epoch = mgr.epoch();
        connector.emit(epoch, TransportSignal::Closed { reason: "gone".into() });
        connector.emit(epoch, TransportSignal::Frame("late".into()));
        mgr.handle_signal(rx.try_recv().unwrap());
        assert_eq!(mgr.handle_signal(rx.try_recv().unwrap()), None);
    }

    // ── Reconnect / epochs ──────────────────────────────────────────

    #[test]
    fn reconnect_bumps_epoch_and_tears_down_first() {
        let (mut mgr, _rx, connector) = connected_manager();
        let old = mgr.epoch();
        mgr.reconnect();
        let new = mgr.epoch();

        assert!(new > old);
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        let calls = connector.calls();
        assert_eq!(
            &calls[1..],
            &[
                Call::Detach { epoch: old },
                Call::Close { epoch: old },
                Call::Open {
                    address: "wss://cases.test/ws/cases/case-1?token=tok".into(),
                    epoch: new,
                },
            ]
        );
    }

    #[test]
    fn stale_epoch_signals_are_discarded() {
        let (mut mgr, mut rx, connector) = connected_manager();
        let old = mgr.epoch();
        mgr.reconnect();

        connector.emit(old, TransportSignal::Frame("stale".into()));
        connector.emit(old, TransportSignal::Closed { reason: "old socket".into() });
        assert_eq!(mgr.handle_signal(rx.try_recv().unwrap()), None);
        assert_eq!(mgr.handle_signal(rx.try_recv().unwrap()), None);
        assert_eq!(mgr.state(), ConnectionState::Connecting);
    }

    #[test]
    fn credential_change_reconnects() {
        let connector = MockConnector::default();
        let resolver = UrlTemplateResolver::new("wss://cases.test").unwrap();
        let var = "CASEROOM_TEST_TOKEN_MANAGER_REFRESH";
        std::env::set_var(var, "first");
        let (mut mgr, _rx) = ConnectionManager::new(
            connector.clone(),
            Box::new(resolver),
            Box::new(crate::credentials::EnvCredential::new(var)),
        );
        mgr.set_case(Some("case-1".into()));
        assert_eq!(connector.opens(), 1);

        assert!(!mgr.refresh_credential());
        std::env::set_var(var, "second");
        assert!(mgr.refresh_credential());
        assert_eq!(connector.opens(), 2);
        std::env::remove_var(var);
    }

    #[test]
    fn clearing_case_disconnects() {
        let (mut mgr, _rx, connector) = connected_manager();
        assert!(mgr.set_case(None));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(connector.opens(), 1);
    }

    // ── Send ────────────────────────────────────────────────────────

    #[test]
    fn send_requires_connected_state() {
        let (mut mgr, _rx, connector) = manager_with(StaticCredential::new("tok"));
        mgr.set_case(Some("case-1".into()));
        assert!(mgr.send_frame("x".into()).is_err());
        assert!(connector.sent_frames().is_empty());
    }

    #[test]
    fn send_failure_tears_down() {
        let (mut mgr, _rx, connector) = connected_manager();
        connector.journal.lock().unwrap().fail_send = true;
        assert!(mgr.send_frame("x".into()).is_err());
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn drop_tears_down_live_connection() {
        let (mgr, _rx, connector) = connected_manager();
        let epoch = mgr.epoch();
        drop(mgr);
        let calls = connector.calls();
        assert_eq!(&calls[calls.len() - 2..], &[Call::Detach { epoch }, Call::Close { epoch }]);
    }
}
