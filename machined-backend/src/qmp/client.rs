use std::path::Path;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;

use super::codec::QmpCodec;
use super::models::{QmpCommand, QmpEvent, QmpGreeting, QmpResponse, QmpVersion};
use crate::error::{Error, Result};

/// A command waiting for its reply: the id we sent and the channel the
/// reader delivers the response on. At most one command is in flight.
type Pending = Arc<Mutex<Option<(String, oneshot::Sender<QmpResponse>)>>>;

/// QMP client over a UNIX stream socket.
///
/// The connection sequence is fixed by the protocol: read the greeting,
/// negotiate capabilities, then issue commands one at a time. Asynchronous
/// events arriving on the same stream are routed to an events channel;
/// when the peer closes the socket the caller-supplied one-shot fires.
///
/// The client applies no deadlines of its own. Callers wrap `connect` and
/// `execute` in their own timeouts and cancel by closing the socket.
#[derive(Debug)]
pub struct QmpClient {
    writer: FramedWrite<OwnedWriteHalf, QmpCodec>,
    pending: Pending,
    events: Option<mpsc::UnboundedReceiver<QmpEvent>>,
    greeting: QmpGreeting,
}

impl QmpClient {
    /// Connect to a QMP socket, read the greeting, and negotiate
    /// capabilities. `closed_tx` fires when the peer closes the stream.
    pub async fn connect(socket_path: &Path, closed_tx: oneshot::Sender<()>) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            Error::QmpConnect {
                path: socket_path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, QmpCodec::new());
        let mut writer = FramedWrite::new(write_half, QmpCodec::new());

        let greeting_value = next_message(&mut reader, "greeting").await?;
        let greeting: QmpGreeting = serde_json::from_value(greeting_value)
            .map_err(|e| Error::QmpProtocol(format!("invalid greeting: {e}")))?;
        tracing::debug!(version = %greeting.qmp.version, "QMP greeting received");

        writer
            .send(json!({"execute": "qmp_capabilities"}))
            .await
            .map_err(|e| Error::QmpProtocol(format!("failed to send qmp_capabilities: {e}")))?;

        let caps_value = next_message(&mut reader, "capabilities response").await?;
        let caps: QmpResponse = serde_json::from_value(caps_value)
            .map_err(|e| Error::QmpProtocol(format!("invalid capabilities response: {e}")))?;
        if let QmpResponse::Error { error, .. } = caps {
            return Err(Error::QmpCommand {
                class: error.class,
                desc: error.desc,
            });
        }

        let pending: Pending = Arc::new(Mutex::new(None));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(reader, Arc::clone(&pending), events_tx, closed_tx));

        Ok(Self {
            writer,
            pending,
            events: Some(events_rx),
            greeting,
        })
    }

    /// QEMU version reported in the greeting.
    #[must_use]
    pub const fn version(&self) -> &QmpVersion {
        &self.greeting.qmp.version
    }

    /// Take the receiver for asynchronous QMP events. Events arriving with
    /// no receiver attached are dropped.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<QmpEvent>> {
        self.events.take()
    }

    /// Execute an arbitrary command, returning its `return` payload.
    pub async fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        let (resp_tx, resp_rx) = oneshot::channel();
        {
            let mut slot = self.pending.lock().expect("pending lock");
            if slot.is_some() {
                return Err(Error::QmpProtocol(
                    "a QMP command is already in flight".to_string(),
                ));
            }
            *slot = Some((id.clone(), resp_tx));
        }

        let mut cmd = QmpCommand::new(command).with_id(id);
        if let Some(arguments) = arguments {
            cmd = cmd.with_args(arguments);
        }
        let message = serde_json::to_value(&cmd)
            .map_err(|e| Error::QmpProtocol(format!("failed to serialize '{command}': {e}")))?;

        tracing::debug!(%command, "QMP send");
        if let Err(e) = self.writer.send(message).await {
            self.pending.lock().expect("pending lock").take();
            return Err(Error::QmpProtocol(format!(
                "failed to send '{command}': {e}"
            )));
        }

        let response = resp_rx.await.map_err(|_| {
            Error::QmpProtocol(format!(
                "connection closed while waiting for reply to '{command}'"
            ))
        })?;

        match response {
            QmpResponse::Success { result, .. } => Ok(result),
            QmpResponse::Error { error, .. } => Err(Error::QmpCommand {
                class: error.class,
                desc: error.desc,
            }),
        }
    }

    /// Ask the guest to power down (graceful, needs in-guest cooperation).
    pub async fn system_powerdown(&mut self) -> Result<()> {
        self.execute("system_powerdown", None).await.map(|_| ())
    }

    /// Tell QEMU to exit immediately.
    pub async fn quit(&mut self) -> Result<()> {
        self.execute("quit", None).await.map(|_| ())
    }

    /// Close the client's write half. The reader task ends when the peer
    /// closes its side.
    pub async fn close(mut self) -> Result<()> {
        self.writer
            .close()
            .await
            .map_err(|e| Error::QmpProtocol(format!("failed to close QMP stream: {e}")))
    }
}

async fn next_message(
    reader: &mut FramedRead<OwnedReadHalf, QmpCodec>,
    what: &str,
) -> Result<Value> {
    match reader.next().await {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(Error::QmpProtocol(format!("failed to read {what}: {e}"))),
        None => Err(Error::QmpProtocol(format!(
            "connection closed before {what}"
        ))),
    }
}

/// Reads the stream until the peer goes away, routing events to the events
/// channel and replies to the waiting command.
async fn read_loop(
    mut reader: FramedRead<OwnedReadHalf, QmpCodec>,
    pending: Pending,
    events_tx: mpsc::UnboundedSender<QmpEvent>,
    closed_tx: oneshot::Sender<()>,
) {
    loop {
        match reader.next().await {
            Some(Ok(value)) => {
                if value.get("event").is_some() {
                    match serde_json::from_value::<QmpEvent>(value) {
                        Ok(event) => {
                            tracing::debug!(event = %event.event, "QMP event");
                            let _ = events_tx.send(event);
                        }
                        Err(e) => tracing::warn!("unparseable QMP event: {e}"),
                    }
                    continue;
                }

                match serde_json::from_value::<QmpResponse>(value) {
                    Ok(response) => {
                        let mut slot = pending.lock().expect("pending lock");
                        let matches = match (&*slot, response.id()) {
                            (Some((want, _)), Some(got)) => want == got,
                            (Some(_), None) => true,
                            (None, _) => false,
                        };
                        if matches {
                            if let Some((_, tx)) = slot.take() {
                                let _ = tx.send(response);
                            }
                        } else {
                            tracing::debug!("dropping unmatched QMP reply");
                        }
                    }
                    Err(e) => tracing::warn!("unparseable QMP message: {e}"),
                }
            }
            Some(Err(e)) => {
                tracing::warn!("QMP read error: {e}");
                break;
            }
            None => break,
        }
    }

    // Wake any waiter with a closed-channel error, then signal the owner.
    pending.lock().expect("pending lock").take();
    let _ = closed_tx.send(());
}
