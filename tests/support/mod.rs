#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use room_chat::messages::{ClientFrame, ServerFrame};
use room_chat::{
    ChatMessage, ConnectionState, Connector, CredentialProvider, HistoryApi, HistoryFetchError, Link,
    MessageId, PageCursor, RoomId, SessionConfig, TransportError, TranslationMode,
};
use serde_json::json;
use tokio::sync::{mpsc, watch, Semaphore};

pub const ROOM: RoomId = 3;
pub const USER: i64 = 7;
const WAIT: Duration = Duration::from_secs(5);

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting in test")
}

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        user_id: USER,
        connect_timeout_ms: 300,
        reconnect_delay_ms: 10,
        max_reconnect_delay_ms: 40,
        max_reconnect_attempts: 0,
        publish_retry_timeout_ms: 2_000,
        ..SessionConfig::default()
    }
}

pub fn message(room_id: RoomId, id: MessageId, content: &str) -> ChatMessage {
    ChatMessage {
        id,
        room_id,
        sender_id: 1,
        sender_display_name: "peer".into(),
        sender_avatar_url: None,
        origin_content: content.into(),
        translated_content: None,
        sent_at: DateTime::from_timestamp(1_700_000_000 + id, 0).unwrap(),
    }
}

pub fn translated(room_id: RoomId, id: MessageId) -> ChatMessage {
    ChatMessage {
        translated_content: Some(format!("translated {id}")),
        ..message(room_id, id, &format!("origin {id}"))
    }
}

pub async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
    within(rx.wait_for(|s| *s == state))
        .await
        .expect("transport task gone");
}

/// Server end of one fake socket.
pub struct FakeSocket {
    pub from_client: mpsc::Receiver<ClientFrame>,
    pub to_client: mpsc::Sender<ServerFrame>,
}

impl FakeSocket {
    pub async fn recv(&mut self) -> ClientFrame {
        within(self.from_client.recv())
            .await
            .expect("client closed the socket")
    }

    pub async fn send(&self, frame: ServerFrame) {
        self.to_client.send(frame).await.expect("client gone");
    }

    /// Reads the connect frame, acks it and collects both subscriptions.
    /// Returns the token and `destination -> subscription id`.
    pub async fn accept(&mut self) -> (String, HashMap<String, String>) {
        let ClientFrame::Connect { token } = self.recv().await else {
            panic!("expected connect frame");
        };
        self.send(ServerFrame::Connected).await;
        let mut subscriptions = HashMap::new();
        for _ in 0..2 {
            match self.recv().await {
                ClientFrame::Subscribe { id, destination } => {
                    subscriptions.insert(destination, id);
                }
                other => panic!("expected subscribe, got {other:?}"),
            }
        }
        (token, subscriptions)
    }

    pub async fn push_inbox(&self, msg: &ChatMessage) {
        self.send(ServerFrame::Message {
            subscription: None,
            destination: format!("/topic/user.{USER}"),
            body: serde_json::to_value(msg).unwrap(),
        })
        .await;
    }

    pub async fn push_delete(&self, id: MessageId) {
        self.send(ServerFrame::Message {
            subscription: None,
            destination: format!("/topic/room.{ROOM}"),
            body: json!({ "type": "delete", "id": id }),
        })
        .await;
    }
}

/// Hands each opened socket's server end to the test.
pub struct FakeConnector {
    sockets: mpsc::UnboundedSender<FakeSocket>,
    failures: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeSocket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            sockets: tx,
            failures: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// The next `n` opens fail with a connection error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self) -> Result<Link, TransportError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Connection("refused".into()));
        }
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let _ = self.sockets.send(FakeSocket {
            from_client: out_rx,
            to_client: in_tx,
        });
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Starts with `token`; each refresh hands out the next scripted value once
/// a permit is released.
pub struct ScriptedCredentials {
    token: Mutex<Option<String>>,
    refreshes: Mutex<VecDeque<Option<String>>>,
    gate: Semaphore,
    pub refresh_calls: AtomicUsize,
}

impl ScriptedCredentials {
    pub fn new(token: Option<&str>, refreshes: Vec<Option<&str>>) -> Arc<Self> {
        Self::build(token, refreshes, Semaphore::MAX_PERMITS)
    }

    /// Refreshes block until [`ScriptedCredentials::release`] is called.
    pub fn gated(token: Option<&str>, refreshes: Vec<Option<&str>>) -> Arc<Self> {
        Self::build(token, refreshes, 0)
    }

    fn build(token: Option<&str>, refreshes: Vec<Option<&str>>, permits: usize) -> Arc<Self> {
        Arc::new(ScriptedCredentials {
            token: Mutex::new(token.map(str::to_string)),
            refreshes: Mutex::new(refreshes.into_iter().map(|t| t.map(str::to_string)).collect()),
            gate: Semaphore::new(permits),
            refresh_calls: AtomicUsize::new(0),
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl CredentialProvider for ScriptedCredentials {
    async fn token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    async fn refresh(&self) -> Option<String> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.acquire().await.ok()?;
        permit.forget();
        let next = self.refreshes.lock().unwrap().pop_front().flatten();
        *self.token.lock().unwrap() = next.clone();
        next
    }

    async fn clear(&self) {
        *self.token.lock().unwrap() = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    History(PageCursor, TranslationMode),
    SetTranslation(bool),
    Context(MessageId),
    Search(String),
    Delete(MessageId),
}

/// In-memory room history. Pages are `page_size` messages, newest first.
pub struct FakeHistory {
    messages: Mutex<Vec<ChatMessage>>,
    page_size: usize,
    context_radius: usize,
    pub calls: Mutex<Vec<Call>>,
    fail_next: Mutex<bool>,
    /// Fails the first call equal to this one.
    fail_on: Mutex<Option<Call>>,
    /// When set, older-page calls wait for a permit.
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeHistory {
    /// A room holding ids `1..=count`, each mentioning its id.
    pub fn with_ids(count: MessageId, page_size: usize) -> Arc<Self> {
        let messages = (1..=count)
            .rev()
            .map(|id| message(ROOM, id, &format!("message {id}")))
            .collect();
        Self::with_messages(messages, page_size)
    }

    pub fn with_messages(mut messages: Vec<ChatMessage>, page_size: usize) -> Arc<Self> {
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        Arc::new(FakeHistory {
            messages: Mutex::new(messages),
            page_size,
            context_radius: 2,
            calls: Mutex::new(Vec::new()),
            fail_next: Mutex::new(false),
            fail_on: Mutex::new(None),
            gate: Mutex::new(None),
        })
    }

    pub fn fail_next(&self) {
        *self.fail_next.lock().unwrap() = true;
    }

    pub fn fail_on(&self, call: Call) {
        *self.fail_on.lock().unwrap() = Some(call);
    }

    pub fn hold_older_pages(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) -> Result<(), HistoryFetchError> {
        let targeted = {
            let mut fail_on = self.fail_on.lock().unwrap();
            let hit = fail_on.as_ref() == Some(&call);
            if hit {
                *fail_on = None;
            }
            hit
        };
        self.calls.lock().unwrap().push(call);
        if std::mem::take(&mut *self.fail_next.lock().unwrap()) || targeted {
            return Err(HistoryFetchError::Status {
                status: 503,
                message: "unavailable".into(),
            });
        }
        Ok(())
    }

    async fn wait_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
    }

    fn project(&self, msg: &ChatMessage, mode: TranslationMode) -> ChatMessage {
        match mode {
            TranslationMode::Off => ChatMessage {
                translated_content: None,
                ..msg.clone()
            },
            TranslationMode::On => ChatMessage {
                translated_content: Some(format!("translated {}", msg.id)),
                ..msg.clone()
            },
        }
    }
}

#[async_trait]
impl HistoryApi for FakeHistory {
    async fn history(
        &self,
        _room_id: RoomId,
        cursor: PageCursor,
        mode: TranslationMode,
    ) -> Result<Vec<ChatMessage>, HistoryFetchError> {
        self.record(Call::History(cursor, mode))?;
        if matches!(cursor, PageCursor::Before(_)) {
            self.wait_gate().await;
        }
        let all = self.messages.lock().unwrap().clone();
        let page: Vec<ChatMessage> = match cursor {
            PageCursor::Head => all.iter().take(self.page_size).cloned().collect(),
            PageCursor::Before(id) => all
                .iter()
                .filter(|m| m.id < id)
                .take(self.page_size)
                .cloned()
                .collect(),
            PageCursor::After(id) => {
                let newer: Vec<_> = all.iter().filter(|m| m.id > id).cloned().collect();
                let skip = newer.len().saturating_sub(self.page_size);
                newer.into_iter().skip(skip).collect()
            }
        };
        Ok(page.iter().map(|m| self.project(m, mode)).collect())
    }

    async fn set_translation(&self, _room_id: RoomId, enabled: bool) -> Result<(), HistoryFetchError> {
        self.record(Call::SetTranslation(enabled))
    }

    async fn context_around(
        &self,
        _room_id: RoomId,
        message_id: MessageId,
    ) -> Result<Vec<ChatMessage>, HistoryFetchError> {
        self.record(Call::Context(message_id))?;
        let all = self.messages.lock().unwrap().clone();
        let Some(pos) = all.iter().position(|m| m.id == message_id) else {
            return Ok(Vec::new());
        };
        let start = pos.saturating_sub(self.context_radius);
        let end = (pos + self.context_radius + 1).min(all.len());
        Ok(all[start..end].to_vec())
    }

    async fn search(&self, _room_id: RoomId, keyword: &str) -> Result<Vec<ChatMessage>, HistoryFetchError> {
        self.record(Call::Search(keyword.to_string()))?;
        let needle = keyword.to_lowercase();
        let all = self.messages.lock().unwrap().clone();
        Ok(all
            .into_iter()
            .filter(|m| m.origin_content.to_lowercase().contains(&needle))
            .collect())
    }

    async fn delete_message(&self, _room_id: RoomId, message_id: MessageId) -> Result<(), HistoryFetchError> {
        self.record(Call::Delete(message_id))
    }
}
