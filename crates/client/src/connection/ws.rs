// WebSocket transport built on tokio-tungstenite.
//
// `open` spawns one driver task per connection. The task owns the socket,
// forwards inbound text frames as `TransportSignal::Frame` and writes
// whatever the `WsConnection` handle queues. Once the handle is detached the
// task keeps draining the socket but stops emitting signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use super::{Connection, Connector, Epoch, SignalSender, TaggedSignal, TransportSignal};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens real websocket connections. Requires a tokio runtime.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self { connect_timeout: DEFAULT_CONNECT_TIMEOUT }
    }
}

impl WsConnector {
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

enum Outbound {
    Frame(String),
    Close,
}

pub struct WsConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    attached: Arc<AtomicBool>,
}

impl Connection for WsConnection {
    fn send(&mut self, frame: String) -> Result<()> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| anyhow!("websocket writer has shut down"))
    }

    fn detach(&mut self) {
        self.attached.store(false, Ordering::Release);
    }

    fn close(&mut self) {
        self.detach();
        // The driver may already be gone; closing twice is harmless.
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    fn open(
        &mut self,
        address: &Url,
        epoch: Epoch,
        signals: SignalSender,
    ) -> Result<WsConnection> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("websocket connector requires a tokio runtime")?;
        let attached = Arc::new(AtomicBool::new(true));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let tap = SignalTap { epoch, signals, attached: Arc::clone(&attached) };
        runtime.spawn(drive(address.clone(), self.connect_timeout, tap, outbound_rx));
        Ok(WsConnection { outbound, attached })
    }
}

struct SignalTap {
    epoch: Epoch,
    signals: SignalSender,
    attached: Arc<AtomicBool>,
}

impl SignalTap {
    fn emit(&self, signal: TransportSignal) {
        if !self.attached.load(Ordering::Acquire) {
            return;
        }
        // The receiver lives as long as the session; a send error only
        // means the session is gone.
        let _ = self.signals.send(TaggedSignal { epoch: self.epoch, signal });
    }
}

async fn drive(
    address: Url,
    connect_timeout: Duration,
    tap: SignalTap,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let socket = match timeout(connect_timeout, connect_async(address.as_str())).await {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(error)) => {
            tap.emit(TransportSignal::Error {
                message: format!("websocket connect failed: {error}"),
            });
            return;
        }
        Err(_) => {
            tap.emit(TransportSignal::Error {
                message: format!("websocket connect timed out after {connect_timeout:?}"),
            });
            return;
        }
    };

    tap.emit(TransportSignal::Opened);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            command = outbound.recv() => {
                match command {
                    Some(Outbound::Frame(text)) => {
                        if let Err(error) = sink.send(Message::text(text)).await {
                            tap.emit(TransportSignal::Error {
                                message: format!("websocket write failed: {error}"),
                            });
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        tap.emit(TransportSignal::Frame(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| frame.reason.as_str().to_owned())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        tap.emit(TransportSignal::Closed { reason });
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(epoch = %tap.epoch, "ignoring binary frame on case stream");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(error)) => {
                        tap.emit(TransportSignal::Error {
                            message: format!("websocket read failed: {error}"),
                        });
                        break;
                    }
                    None => {
                        tap.emit(TransportSignal::Closed { reason: "stream ended".to_string() });
                        break;
                    }
                }
            }
        }
    }
}
