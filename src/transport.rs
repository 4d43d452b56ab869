//! Persistent pub/sub connection for one room session.
//!
//! A [`TransportSession`] is a handle to a background task that owns the
//! socket. The task connects with the current access token, subscribes to the
//! user's inbox and the room broadcast topic, forwards normalised events on a
//! channel, and reconnects on failure. Authentication errors go through a
//! credential refresh instead of a bare reconnect.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::SessionConfig;
use crate::credentials::CredentialProvider;
use crate::error::{AuthError, SessionError, TransportError};
use crate::messages::{ClientFrame, FrameErrorKind, RoomEvent, ServerFrame, Topic};
use crate::model::{ChatMessage, RoomId, UserId};

const LINK_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    AuthExpired,
    Reconnecting,
}

/// What the session delivers to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A message from the user inbox topic. May belong to another room.
    Inbox(ChatMessage),
    /// A structural event from the room broadcast topic.
    Room(RoomEvent),
    /// The session gave up; no further events follow.
    Terminated(SessionError),
}

/// One open socket, as a pair of frame channels.
///
/// Dropping `outbound` closes the socket; `inbound` yields `None` once the
/// peer is gone.
pub struct Link {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: mpsc::Receiver<ServerFrame>,
}

/// Opens sockets for a transport session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Link, TransportError>;
}

/// [`Connector`] over a WebSocket, one JSON frame per text message.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        WsConnector { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> Result<Link, TransportError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<ServerFrame>(LINK_BUFFER);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping unserializable frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    warn!("Failed to send WebSocket message: {e}");
                    return;
                }
            }
            let _ = ws_tx.close().await;
        });

        tokio::spawn(async move {
            while let Some(result) = ws_rx.next().await {
                let frame = match result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => ServerFrame::Error {
                            kind: FrameErrorKind::Protocol,
                            message: format!("unparseable frame: {e}"),
                        },
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket error: {e}");
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

enum Command {
    Publish {
        frame: ClientFrame,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    /// Drop the current socket and connect again without waiting out the backoff.
    Reconnect { ack: oneshot::Sender<()> },
    Shutdown { done: oneshot::Sender<()> },
}

/// Handle to the connection task of one room.
///
/// Dropping the last handle tears the connection down: the task unsubscribes
/// and closes the socket once it sees the command channel close.
pub struct TransportSession {
    state: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
    publish_retry_timeout: Duration,
}

impl TransportSession {
    pub fn start(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        user_id: UserId,
        room_id: RoomId,
        config: &SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            connector,
            credentials,
            topics: vec![Topic::UserInbox(user_id), Topic::RoomBroadcast(room_id)],
            subscriptions: HashMap::new(),
            connect_timeout: config.connect_timeout(),
            backoff: Backoff::new(
                config.reconnect_delay(),
                config.max_reconnect_delay(),
                config.max_reconnect_attempts,
            ),
            state: state_tx,
            events: event_tx,
            commands: command_rx,
        };
        tokio::spawn(actor.run());

        let session = TransportSession {
            state: state_rx,
            commands: command_tx,
            publish_retry_timeout: config.publish_retry_timeout(),
        };
        (session, event_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Fire-and-forget publish to `destination`.
    ///
    /// If the socket turns out to be stale, forces one reconnect and retries
    /// exactly once.
    pub async fn publish<T: Serialize>(&self, destination: &str, body: &T) -> Result<(), TransportError> {
        let body = serde_json::to_value(body).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let frame = ClientFrame::Send {
            destination: destination.to_string(),
            body,
        };

        match self.publish_once(frame.clone()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Publish to {destination} failed ({err}), reconnecting and retrying once");
                self.force_reconnect().await?;
                self.wait_connected(self.publish_retry_timeout).await?;
                self.publish_once(frame).await
            }
        }
    }

    async fn publish_once(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Publish { frame, reply })
            .map_err(|_| TransportError::Closed)?;
        response.await.map_err(|_| TransportError::Closed)?
    }

    async fn force_reconnect(&self) -> Result<(), TransportError> {
        let (ack, acked) = oneshot::channel();
        self.commands
            .send(Command::Reconnect { ack })
            .map_err(|_| TransportError::Closed)?;
        acked.await.map_err(|_| TransportError::Closed)
    }

    /// Waits until the session is connected, or fails if it terminates first.
    pub async fn wait_connected(&self, limit: Duration) -> Result<(), TransportError> {
        let mut state = self.state.clone();
        let reached = tokio::time::timeout(
            limit,
            state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected)),
        )
        .await
        .map_err(|_| TransportError::Timeout(limit))?
        .map(|s| *s)
        .map_err(|_| TransportError::Closed)?;

        if reached == ConnectionState::Connected {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Unsubscribes, closes the socket and waits for the task to stop.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = finished.await;
        }
    }
}

enum LinkEnd {
    Dropped(TransportError),
    AuthRejected(String),
    Forced(oneshot::Sender<()>),
    Exit(Exit),
}

enum ConnectFailure {
    Transport(TransportError),
    Auth(String),
    Exit(Exit),
}

enum Exit {
    Shutdown(Option<oneshot::Sender<()>>),
    Failed(SessionError),
}

struct Actor {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    topics: Vec<Topic>,
    subscriptions: HashMap<String, Topic>,
    connect_timeout: Duration,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Actor {
    async fn run(mut self) {
        let exit = self.drive().await;

        self.set_state(ConnectionState::Disconnected);
        match exit {
            Exit::Shutdown(done) => {
                info!("Transport session closed");
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Exit::Failed(err) => {
                error!("Transport session terminated: {err}");
                let _ = self.events.send(TransportEvent::Terminated(err));
            }
        }
        // Late commands find a closed session.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            self.reject(command);
        }
    }

    async fn drive(&mut self) -> Exit {
        let credentials = Arc::clone(&self.credentials);
        let first = self
            .await_credentials(async move {
                match credentials.token().await {
                    Some(token) => Some(token),
                    None => credentials.refresh().await,
                }
            })
            .await;
        let mut token = match first {
            Ok(Some(token)) => token,
            Ok(None) => return Exit::Failed(AuthError::MissingToken.into()),
            Err(exit) => return exit,
        };
        let mut auth_failures = 0u32;

        loop {
            self.set_state(ConnectionState::Connecting);
            let failure = match self.connect(&token).await {
                Ok(link) => {
                    auth_failures = 0;
                    self.backoff.reset();
                    match self.serve(link).await {
                        LinkEnd::Exit(exit) => return exit,
                        LinkEnd::Forced(ack) => {
                            self.set_state(ConnectionState::Connecting);
                            let _ = ack.send(());
                            continue;
                        }
                        LinkEnd::AuthRejected(reason) => ConnectFailure::Auth(reason),
                        LinkEnd::Dropped(err) => ConnectFailure::Transport(err),
                    }
                }
                Err(failure) => failure,
            };

            match failure {
                ConnectFailure::Exit(exit) => return exit,
                ConnectFailure::Auth(reason) => {
                    auth_failures += 1;
                    self.set_state(ConnectionState::AuthExpired);
                    warn!("Access token rejected: {reason}");
                    if auth_failures > 1 {
                        // A freshly refreshed token was rejected too.
                        return Exit::Failed(AuthError::Rejected(reason).into());
                    }
                    let credentials = Arc::clone(&self.credentials);
                    match self.await_credentials(async move { credentials.refresh().await }).await {
                        Ok(Some(fresh)) => token = fresh,
                        Ok(None) => return Exit::Failed(AuthError::RefreshFailed.into()),
                        Err(exit) => return exit,
                    }
                }
                ConnectFailure::Transport(err) => {
                    if let Err(exit) = self.pause(err).await {
                        return exit;
                    }
                }
            }
        }
    }

    /// Waits on the credential provider while still serving commands, so a
    /// shutdown is never held up by a slow refresh.
    async fn await_credentials<F>(&mut self, fetch: F) -> Result<Option<String>, Exit>
    where
        F: Future<Output = Option<String>>,
    {
        tokio::pin!(fetch);
        loop {
            tokio::select! {
                token = &mut fetch => return Ok(token),
                command = self.commands.recv() => {
                    if let Some(exit) = self.idle_command(command) {
                        return Err(exit);
                    }
                }
            }
        }
    }

    async fn connect(&mut self, token: &str) -> Result<Link, ConnectFailure> {
        let connector = Arc::clone(&self.connector);
        let token = token.to_string();
        let limit = self.connect_timeout;
        let attempt = tokio::time::timeout(limit, async move {
            let mut link = connector.open().await.map_err(ConnectFailure::Transport)?;
            link.outbound
                .send(ClientFrame::Connect { token })
                .await
                .map_err(|_| ConnectFailure::Transport(TransportError::Closed))?;
            match link.inbound.recv().await {
                Some(ServerFrame::Connected) => Ok(link),
                Some(ServerFrame::Error { kind: FrameErrorKind::Auth, message }) => {
                    Err(ConnectFailure::Auth(message))
                }
                Some(ServerFrame::Error { message, .. }) => {
                    Err(ConnectFailure::Transport(TransportError::Protocol(message)))
                }
                Some(frame) => Err(ConnectFailure::Transport(TransportError::Protocol(format!(
                    "unexpected frame before ack: {frame:?}"
                )))),
                None => Err(ConnectFailure::Transport(TransportError::Closed)),
            }
        });
        tokio::pin!(attempt);

        let link = loop {
            tokio::select! {
                result = &mut attempt => match result {
                    Ok(Ok(link)) => break link,
                    Ok(Err(failure)) => return Err(failure),
                    Err(_) => return Err(ConnectFailure::Transport(TransportError::Timeout(limit))),
                },
                command = self.commands.recv() => {
                    if let Some(exit) = self.idle_command(command) {
                        return Err(ConnectFailure::Exit(exit));
                    }
                }
            }
        };

        self.subscribe(&link).await.map_err(ConnectFailure::Transport)?;
        self.set_state(ConnectionState::Connected);
        Ok(link)
    }

    async fn subscribe(&mut self, link: &Link) -> Result<(), TransportError> {
        self.subscriptions.clear();
        for topic in self.topics.clone() {
            let id = Uuid::new_v4().to_string();
            let destination = topic.destination();
            debug!("Subscribing {id} to {destination}");
            link.outbound
                .send(ClientFrame::Subscribe { id: id.clone(), destination })
                .await
                .map_err(|_| TransportError::Closed)?;
            self.subscriptions.insert(id, topic);
        }
        Ok(())
    }

    async fn serve(&mut self, mut link: Link) -> LinkEnd {
        loop {
            tokio::select! {
                frame = link.inbound.recv() => match frame {
                    Some(ServerFrame::Message { subscription, destination, body }) => {
                        self.deliver(subscription.as_deref(), &destination, body);
                    }
                    Some(ServerFrame::Error { kind: FrameErrorKind::Auth, message }) => {
                        return LinkEnd::AuthRejected(message);
                    }
                    Some(ServerFrame::Error { message, .. }) => {
                        return LinkEnd::Dropped(TransportError::Protocol(message));
                    }
                    Some(ServerFrame::Connected) => debug!("Ignoring repeated connect ack"),
                    None => return LinkEnd::Dropped(TransportError::Closed),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Publish { frame, reply }) => {
                        if link.outbound.send(frame).await.is_err() {
                            let _ = reply.send(Err(TransportError::Closed));
                            return LinkEnd::Dropped(TransportError::Closed);
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Some(Command::Reconnect { ack }) => {
                        info!("Forced reconnect");
                        self.close_link(link).await;
                        return LinkEnd::Forced(ack);
                    }
                    Some(Command::Shutdown { done }) => {
                        self.close_link(link).await;
                        return LinkEnd::Exit(Exit::Shutdown(Some(done)));
                    }
                    None => {
                        self.close_link(link).await;
                        return LinkEnd::Exit(Exit::Shutdown(None));
                    }
                },
            }
        }
    }

    /// Waits out the next backoff delay. A forced reconnect cuts it short.
    async fn pause(&mut self, err: TransportError) -> Result<(), Exit> {
        self.set_state(ConnectionState::Reconnecting);
        let Some(delay) = self.backoff.next_delay() else {
            return Err(Exit::Failed(SessionError::ReconnectExhausted {
                attempts: self.backoff.attempt(),
                last: err,
            }));
        };
        warn!("Connection lost ({err}), reconnecting in {delay:?}");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return Ok(()),
                command = self.commands.recv() => match command {
                    Some(Command::Reconnect { ack }) => {
                        let _ = ack.send(());
                        return Ok(());
                    }
                    other => {
                        if let Some(exit) = self.idle_command(other) {
                            return Err(exit);
                        }
                    }
                },
            }
        }
    }

    /// Handles a command while no socket is up.
    fn idle_command(&mut self, command: Option<Command>) -> Option<Exit> {
        match command {
            None => Some(Exit::Shutdown(None)),
            Some(Command::Shutdown { done }) => Some(Exit::Shutdown(Some(done))),
            // Already on the way to a fresh connection.
            Some(Command::Reconnect { ack }) => {
                let _ = ack.send(());
                None
            }
            Some(command) => {
                self.reject(command);
                None
            }
        }
    }

    fn reject(&self, command: Command) {
        match command {
            Command::Publish { reply, .. } => {
                let _ = reply.send(Err(TransportError::Closed));
            }
            Command::Reconnect { ack } => drop(ack),
            Command::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    fn deliver(&self, subscription: Option<&str>, destination: &str, body: Value) {
        let topic = subscription
            .and_then(|id| self.subscriptions.get(id).copied())
            .or_else(|| self.topics.iter().copied().find(|t| t.destination() == destination));

        let event = match topic {
            Some(Topic::UserInbox(_)) => match ChatMessage::from_value(body) {
                Ok(message) => TransportEvent::Inbox(message),
                Err(e) => {
                    warn!("Dropping malformed inbox message: {e}");
                    return;
                }
            },
            Some(Topic::RoomBroadcast(_)) => match serde_json::from_value::<RoomEvent>(body) {
                Ok(event) => TransportEvent::Room(event),
                Err(e) => {
                    warn!("Dropping malformed room event: {e}");
                    return;
                }
            },
            None => {
                debug!("Frame for unknown destination {destination}");
                return;
            }
        };
        let _ = self.events.send(event);
    }

    async fn close_link(&mut self, link: Link) {
        for id in self.subscriptions.keys() {
            let _ = link.outbound.send(ClientFrame::Unsubscribe { id: id.clone() }).await;
        }
        let _ = link.outbound.send(ClientFrame::Disconnect).await;
        self.subscriptions.clear();
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!("Connection state {prev:?} -> {next:?}");
        }
    }
}
