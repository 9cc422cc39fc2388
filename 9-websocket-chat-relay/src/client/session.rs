use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::reconnect::{ConnectionState, ReconnectState, Transition};
use crate::{
    config::ReconnectPolicy,
    message::{ChatMessage, Inbound, decode_inbound, decode_inbound_bytes},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const CONNECTED_NOTICE: &str = "connected to chat";
pub const EXHAUSTED_NOTICE: &str =
    "could not reach the server; restart the client to try again";
pub const NOT_CONNECTED_NOTICE: &str = "not connected to the server; message was not sent";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full WebSocket URL, path included.
    pub url: String,
    pub user: String,
    pub reconnect: ReconnectPolicy,
}

/// Connection flag shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// What the UI layer receives from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Something relayed by the hub.
    Message(Inbound),
    /// Generated locally about the connection itself.
    Notice(String),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected to the chat server")]
    NotConnected,
    #[error("failed to encode chat message")]
    Encode(#[from] serde_json::Error),
}

/// State shared between the driver task and every [`ClientHandle`].
struct Shared {
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    status: watch::Sender<ConnectionStatus>,
    state: watch::Sender<ConnectionState>,
    close: watch::Sender<bool>,
}

impl Shared {
    fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>, watch::Receiver<bool>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (close, close_rx) = watch::channel(false);

        let shared = Self {
            outbound: Mutex::new(None),
            events,
            status,
            state,
            close,
        };
        (shared, events_rx, close_rx)
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notice(&self, text: &str) {
        let _ = self.events.send(ClientEvent::Notice(text.to_string()));
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    fn publish(&self, machine: &ReconnectState) {
        self.state.send_replace(machine.state());
    }
}

/// Cheap, cloneable surface the UI uses to talk to a running client.
#[derive(Clone)]
pub struct ClientHandle {
    user: String,
    shared: Arc<Shared>,
}

impl ClientHandle {
    /// Sends `text` as a chat message from this client's user.
    ///
    /// Only succeeds while the connection is open. Otherwise the UI also gets
    /// a local notice and the caller keeps its input.
    pub fn send(&self, text: &str) -> Result<(), SendError> {
        let payload = serde_json::to_string(&ChatMessage::new(self.user.as_str(), text))?;

        let delivered = match self.shared.outbound().as_ref() {
            Some(sender) => sender.send(Message::Text(payload)).is_ok(),
            None => false,
        };

        if delivered {
            debug!(text, "message queued");
            Ok(())
        } else {
            warn!("not connected; message not sent");
            self.shared.notice(NOT_CONNECTED_NOTICE);
            Err(SendError::NotConnected)
        }
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.status.borrow() == ConnectionStatus::Connected
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Cancels any pending retry and closes the live connection.
    pub fn close(&self) {
        self.shared.close.send_replace(true);
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

/// A client that keeps one logical connection to the hub alive across drops.
pub struct ResilientClient {
    handle: ClientHandle,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    task: JoinHandle<()>,
}

impl ResilientClient {
    /// Starts connecting in the background.
    ///
    /// The driver stops on [`ClientHandle::close`], or once the event receiver
    /// is dropped along with the client.
    pub fn spawn(config: ClientConfig) -> Self {
        let (shared, events, close_rx) = Shared::new();
        let shared = Arc::new(shared);
        let handle = ClientHandle {
            user: config.user.clone(),
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(drive(config, shared, close_rx));

        Self {
            handle,
            events,
            task,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    pub fn into_parts(
        self,
    ) -> (
        ClientHandle,
        mpsc::UnboundedReceiver<ClientEvent>,
        JoinHandle<()>,
    ) {
        (self.handle, self.events, self.task)
    }

    /// Tears the client down and waits for the driver to finish.
    pub async fn shutdown(self) {
        self.handle.close();
        if let Err(error) = self.task.await {
            warn!(%error, "client driver ended abnormally");
        }
    }
}

/// Resolves on an explicit close, or when nobody listens for events anymore.
async fn wait_closed(shared: &Shared, close: &mut watch::Receiver<bool>) {
    let requested = async {
        let _ = close.wait_for(|closed| *closed).await;
    };
    select! {
        _ = requested => {}
        _ = shared.events.closed() => debug!("event receiver dropped; closing"),
    }
}

async fn drive(config: ClientConfig, shared: Arc<Shared>, mut close: watch::Receiver<bool>) {
    let mut machine = ReconnectState::new(config.reconnect);

    loop {
        shared.publish(&machine);
        info!(url = %config.url, attempt = machine.attempts(), "connecting");

        let attempt = select! {
            result = connect_async(config.url.as_str()) => result,
            _ = wait_closed(&shared, &mut close) => break,
        };

        match attempt {
            Ok((socket, _)) => {
                machine.on_open();
                shared.publish(&machine);
                info!(url = %config.url, "connected");

                let end = run_session(socket, &shared, &mut close).await;
                shared.set_status(ConnectionStatus::Disconnected);
                if end == SessionEnd::Closed {
                    break;
                }
            }
            Err(error) => warn!(url = %config.url, %error, "connection attempt failed"),
        }

        match machine.on_closed() {
            Transition::Retry { attempt, delay } => {
                shared.publish(&machine);
                info!(
                    attempt,
                    max_attempts = machine.policy().max_attempts,
                    ?delay,
                    "reconnecting after backoff"
                );
                select! {
                    _ = tokio::time::sleep(delay) => machine.on_retry_elapsed(),
                    _ = wait_closed(&shared, &mut close) => break,
                }
            }
            Transition::GiveUp => {
                shared.publish(&machine);
                warn!(attempts = machine.attempts(), "giving up on reconnecting");
                shared.notice(EXHAUSTED_NOTICE);
                return;
            }
        }
    }

    machine.close();
    shared.publish(&machine);
    shared.set_status(ConnectionStatus::Disconnected);
    info!("client closed");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The connection dropped; the reconnect machine decides what is next.
    Dropped,
    /// The owner asked to close.
    Closed,
}

async fn run_session(
    socket: Socket,
    shared: &Shared,
    close: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();
    let mut outbound = attach(shared);
    shared.set_status(ConnectionStatus::Connected);
    shared.notice(CONNECTED_NOTICE);

    loop {
        select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => deliver(shared, decode_inbound(&text).map_err(Into::into)),
                    Some(Ok(Message::Binary(bytes))) => deliver(shared, decode_inbound_bytes(&bytes)),
                    Some(Ok(Message::Close(frame))) => {
                        detach(shared, &mut outbound, 0);
                        info!(?frame, "server closed the connection");
                        return SessionEnd::Dropped;
                    }
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        detach(shared, &mut outbound, 0);
                        warn!(%error, "connection failed");
                        return SessionEnd::Dropped;
                    }
                    None => {
                        detach(shared, &mut outbound, 0);
                        return SessionEnd::Dropped;
                    }
                }
            }
            Some(message) = outbound.recv() => {
                if let Err(error) = sink.send(message).await {
                    detach(shared, &mut outbound, 1);
                    warn!(%error, "failed to send message");
                    return SessionEnd::Dropped;
                }
            }
            _ = wait_closed(shared, close) => {
                detach(shared, &mut outbound, 0);
                if let Err(error) = sink.send(Message::Close(None)).await {
                    debug!(%error, "failed to send close frame");
                }
                return SessionEnd::Closed;
            }
        }
    }
}

/// Installs the outbound queue for a new session so sends start succeeding.
fn attach(shared: &Shared) -> mpsc::UnboundedReceiver<Message> {
    let (sender, receiver) = mpsc::unbounded_channel();
    shared.outbound().replace(sender);
    receiver
}

/// Stops accepting sends for a finished session. Messages that were accepted
/// but never reached the socket are counted, reported to the UI, and returned.
fn detach(
    shared: &Shared,
    outbound: &mut mpsc::UnboundedReceiver<Message>,
    already_lost: usize,
) -> usize {
    shared.outbound().take();
    outbound.close();

    let mut lost = already_lost;
    while outbound.try_recv().is_ok() {
        lost += 1;
    }
    if lost > 0 {
        warn!(lost, "connection ended before queued messages were sent");
        shared.notice(NOT_CONNECTED_NOTICE);
    }
    lost
}

fn deliver(shared: &Shared, decoded: anyhow::Result<Inbound>) {
    match decoded {
        Ok(message) => {
            debug!(?message, "message received");
            let _ = shared.events.send(ClientEvent::Message(message));
        }
        Err(error) => warn!(%error, "dropping unreadable message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(shared: &Arc<Shared>) -> ClientHandle {
        ClientHandle {
            user: "alice".into(),
            shared: Arc::clone(shared),
        }
    }

    #[test]
    fn send_is_rejected_once_the_session_is_detached() {
        let (shared, mut events, _close) = Shared::new();
        let shared = Arc::new(shared);
        let handle = handle(&shared);

        let mut outbound = attach(&shared);
        handle.send("queued").expect("session is attached");

        // The queued message never made it out, so the UI hears about it.
        assert_eq!(detach(&shared, &mut outbound, 0), 1);
        assert_eq!(
            events.try_recv().ok(),
            Some(ClientEvent::Notice(NOT_CONNECTED_NOTICE.into()))
        );

        assert!(matches!(
            handle.send("too late"),
            Err(SendError::NotConnected)
        ));
    }

    #[test]
    fn clean_detach_reports_nothing() {
        let (shared, mut events, _close) = Shared::new();
        let shared = Arc::new(shared);

        let mut outbound = attach(&shared);
        assert_eq!(detach(&shared, &mut outbound, 0), 0);
        assert!(events.try_recv().is_err());
    }
}
