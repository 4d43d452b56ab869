//! The chat room session: everything the room screen drives, built on entry
//! and torn down on exit.

use std::ops::Range;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::credentials::CredentialProvider;
use crate::dispatch::{CommandDispatcher, ConfirmedDelete, DeleteRequest};
use crate::error::{CommandRejected, HistoryFetchError, SessionError};
use crate::history::{HistoryApi, PageCursor};
use crate::messages::RoomEvent;
use crate::model::{ChatMessage, MessageId, RoomId};
use crate::search::{RoomSearchSession, SearchNavigator};
use crate::store::{LoadOutcome, MessageStore};
use crate::transport::{ConnectionState, Connector, TransportEvent, TransportSession};
use crate::translation::TranslationMode;

/// A message as the room screen should render it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub id: MessageId,
    pub sender_display_name: String,
    pub sender_avatar_url: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub text: String,
    /// Byte ranges of `text` to emphasize.
    pub highlights: Vec<Range<usize>>,
}

impl DisplayMessage {
    /// `text` split into `(fragment, emphasized)` runs.
    pub fn segments(&self) -> Vec<(&str, bool)> {
        let mut out = Vec::new();
        let mut pos = 0;
        for range in &self.highlights {
            if range.start > pos {
                out.push((&self.text[pos..range.start], false));
            }
            out.push((&self.text[range.clone()], true));
            pos = range.end;
        }
        if pos < self.text.len() {
            out.push((&self.text[pos..], false));
        }
        out
    }
}

struct RoomView {
    store: MessageStore,
    search: SearchNavigator,
    mode: TranslationMode,
}

struct Shared {
    view: RwLock<RoomView>,
    failure: RwLock<Option<SessionError>>,
    revision: watch::Sender<u64>,
}

impl Shared {
    fn touch(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

pub struct RoomSession {
    room_id: RoomId,
    shared: Arc<Shared>,
    transport: Arc<TransportSession>,
    dispatcher: CommandDispatcher,
    history: Arc<dyn HistoryApi>,
    pump: JoinHandle<()>,
}

impl RoomSession {
    /// Starts the transport session for `room_id`. Call
    /// [`RoomSession::load_initial`] to fill the buffer.
    pub fn open(
        room_id: RoomId,
        config: &SessionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        history: Arc<dyn HistoryApi>,
    ) -> Self {
        let (transport, events) =
            TransportSession::start(connector, credentials, config.user_id, room_id, config);
        let transport = Arc::new(transport);
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            view: RwLock::new(RoomView {
                store: MessageStore::new(room_id),
                search: SearchNavigator::default(),
                mode: TranslationMode::Off,
            }),
            failure: RwLock::new(None),
            revision,
        });
        let pump = tokio::spawn(pump_events(Arc::clone(&shared), events));
        let dispatcher =
            CommandDispatcher::new(Arc::clone(&transport), Arc::clone(&history), room_id, config.user_id);

        info!("Opened room {room_id}");
        RoomSession {
            room_id,
            shared,
            transport,
            dispatcher,
            history,
            pump,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.transport.watch_state()
    }

    /// Bumped after every change to the buffer, search or mode.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Set once the transport session has given up.
    pub async fn failure(&self) -> Option<SessionError> {
        self.shared.failure.read().await.clone()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.shared.view.read().await.store.messages().to_vec()
    }

    pub async fn message_ids(&self) -> Vec<MessageId> {
        self.shared.view.read().await.store.ids()
    }

    pub async fn has_more_older(&self) -> bool {
        self.shared.view.read().await.store.has_more_older()
    }

    pub async fn is_at_head(&self) -> bool {
        self.shared.view.read().await.store.is_at_head()
    }

    pub async fn translation_mode(&self) -> TranslationMode {
        self.shared.view.read().await.mode
    }

    pub async fn search_session(&self) -> Option<RoomSearchSession> {
        self.shared.view.read().await.search.session().cloned()
    }

    /// The buffer, newest first, projected through the translation mode and
    /// the search highlight.
    pub async fn display(&self) -> Vec<DisplayMessage> {
        let view = self.shared.view.read().await;
        view.store
            .messages()
            .iter()
            .map(|m| {
                let text = view.mode.display_content(m).to_string();
                let highlights = view.search.highlight(m.id, &text);
                DisplayMessage {
                    id: m.id,
                    sender_display_name: m.sender_display_name.clone(),
                    sender_avatar_url: m.sender_avatar_url.clone(),
                    sent_at: m.sent_at,
                    text,
                    highlights,
                }
            })
            .collect()
    }

    /// Replaces the buffer with the newest page for the current mode. An open
    /// search is closed, since the buffer no longer shows its matches.
    pub async fn load_initial(&self) -> Result<LoadOutcome, HistoryFetchError> {
        let (ticket, mode, closed_search) = {
            let mut view = self.shared.view.write().await;
            (view.store.begin_initial(), view.mode, view.search.close())
        };
        if closed_search {
            debug!("Room {}: search closed by reload", self.room_id);
            self.shared.touch();
        }
        let page = self.history.history(self.room_id, PageCursor::Head, mode).await?;

        let outcome = self.shared.view.write().await.store.finish_initial(ticket, page);
        self.after_load(outcome);
        Ok(outcome)
    }

    /// Appends the page older than the oldest loaded message. At most one
    /// older-page request is in flight at a time.
    pub async fn load_older(&self) -> Result<LoadOutcome, HistoryFetchError> {
        let (ticket, mode) = {
            let mut view = self.shared.view.write().await;
            let ticket = view.store.begin_older();
            (ticket, view.mode)
        };
        let Some(ticket) = ticket else {
            return Ok(LoadOutcome::Skipped);
        };

        let page = self.history.history(self.room_id, ticket.cursor, mode).await;
        let mut view = self.shared.view.write().await;
        match page {
            Ok(page) => {
                let outcome = view.store.finish_older(ticket, page);
                drop(view);
                self.after_load(outcome);
                Ok(outcome)
            }
            Err(e) => {
                view.store.abort_older(ticket);
                Err(e)
            }
        }
    }

    /// Prepends the page newer than the newest loaded message, for a buffer
    /// that was recentered away from the room head.
    pub async fn load_newer(&self) -> Result<LoadOutcome, HistoryFetchError> {
        let (ticket, mode) = {
            let mut view = self.shared.view.write().await;
            let ticket = view.store.begin_newer();
            (ticket, view.mode)
        };
        let Some(ticket) = ticket else {
            return Ok(LoadOutcome::Skipped);
        };

        let page = self.history.history(self.room_id, ticket.cursor, mode).await;
        let mut view = self.shared.view.write().await;
        match page {
            Ok(page) => {
                let outcome = view.store.finish_newer(ticket, page);
                drop(view);
                self.after_load(outcome);
                Ok(outcome)
            }
            Err(e) => {
                view.store.abort_newer(ticket);
                Err(e)
            }
        }
    }

    /// Switches translation on or off server-side, then reloads the buffer
    /// from the matching endpoint. The mode only changes once that page has
    /// been applied, so a failed reload can be retried. An open search is
    /// closed with it.
    pub async fn set_translation(&self, enabled: bool) -> Result<LoadOutcome, HistoryFetchError> {
        let target = TranslationMode::from_enabled(enabled);
        if self.translation_mode().await == target {
            return Ok(LoadOutcome::Skipped);
        }
        self.history.set_translation(self.room_id, enabled).await?;

        let ticket = self.shared.view.write().await.store.begin_initial();
        let page = self.history.history(self.room_id, PageCursor::Head, target).await?;

        let outcome = {
            let mut view = self.shared.view.write().await;
            let outcome = view.store.finish_initial(ticket, page);
            if outcome != LoadOutcome::Discarded {
                view.mode = target;
                view.search.close();
            }
            outcome
        };
        if outcome != LoadOutcome::Discarded {
            info!("Room {}: translation {target:?}", self.room_id);
        }
        self.after_load(outcome);
        Ok(outcome)
    }

    pub async fn toggle_translation(&self) -> Result<LoadOutcome, HistoryFetchError> {
        let current = self.translation_mode().await;
        self.set_translation(!current.is_on()).await
    }

    /// Searches the whole room history and centers the buffer on the first
    /// match. An empty keyword closes the search instead.
    pub async fn search(&self, keyword: &str) -> Result<Option<MessageId>, HistoryFetchError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            self.close_search().await?;
            return Ok(None);
        }

        let hits = self.history.search(self.room_id, keyword).await?;
        let matches: Vec<MessageId> = hits.iter().map(|m| m.id).collect();
        debug!("Room {}: {} matches for {keyword:?}", self.room_id, matches.len());

        let (generation, first) = {
            let mut view = self.shared.view.write().await;
            let Some(first) = view.search.begin(keyword, matches) else {
                drop(view);
                self.shared.touch();
                return Ok(None);
            };
            (view.store.begin_window(), first)
        };
        self.recenter(generation, first, 0).await
    }

    /// Moves to the next match toward the end of the list. A no-op at the
    /// last match.
    pub async fn step_backward(&self) -> Result<Option<MessageId>, HistoryFetchError> {
        let target = {
            let mut view = self.shared.view.write().await;
            match view.search.peek_backward() {
                Some((index, id)) => (view.store.begin_window(), id, index),
                None => return Ok(None),
            }
        };
        self.recenter(target.0, target.1, target.2).await
    }

    /// Moves to the previous match toward index 0. A no-op at the first match.
    pub async fn step_forward(&self) -> Result<Option<MessageId>, HistoryFetchError> {
        let target = {
            let mut view = self.shared.view.write().await;
            match view.search.peek_forward() {
                Some((index, id)) => (view.store.begin_window(), id, index),
                None => return Ok(None),
            }
        };
        self.recenter(target.0, target.1, target.2).await
    }

    /// Ends the search and returns to the newest page of the room.
    pub async fn close_search(&self) -> Result<LoadOutcome, HistoryFetchError> {
        let was_open = self.shared.view.write().await.search.close();
        if !was_open {
            return Ok(LoadOutcome::Skipped);
        }
        self.shared.touch();
        self.load_initial().await
    }

    async fn recenter(
        &self,
        generation: u64,
        message_id: MessageId,
        index: usize,
    ) -> Result<Option<MessageId>, HistoryFetchError> {
        let page = self.history.context_around(self.room_id, message_id).await?;

        let mut view = self.shared.view.write().await;
        match view.store.finish_window(generation, page) {
            LoadOutcome::Discarded => Ok(None),
            _ => {
                view.search.commit(index);
                drop(view);
                self.shared.touch();
                Ok(Some(message_id))
            }
        }
    }

    pub async fn send_message(&self, text: &str) -> Result<(), CommandRejected> {
        self.dispatcher.send_message(text).await
    }

    pub fn prepare_delete(&self, message_id: MessageId) -> DeleteRequest {
        self.dispatcher.prepare_delete(message_id)
    }

    pub async fn delete_message(&self, confirmed: ConfirmedDelete) -> Result<(), CommandRejected> {
        self.dispatcher.delete_message(confirmed).await
    }

    /// Tears the session down. Loads still in flight are discarded.
    pub async fn close(&self) {
        self.shared.view.write().await.store.invalidate();
        self.transport.shutdown().await;
        info!("Closed room {}", self.room_id);
    }

    fn after_load(&self, outcome: LoadOutcome) {
        if matches!(outcome, LoadOutcome::Applied(_) | LoadOutcome::Exhausted) {
            self.shared.touch();
        }
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        // The transport task closes itself once its last handle is gone.
        self.pump.abort();
    }
}

async fn pump_events(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let changed = match event {
            TransportEvent::Inbox(message) => {
                let id = message.id;
                let applied = shared.view.write().await.store.apply_inbound(message);
                if !applied {
                    debug!("Inbound message {id} not applied");
                }
                applied
            }
            TransportEvent::Room(RoomEvent::Delete { id }) => {
                shared.view.write().await.store.apply_delete(id)
            }
            TransportEvent::Room(RoomEvent::Unknown) => false,
            TransportEvent::Terminated(err) => {
                error!("Room transport failed: {err}");
                *shared.failure.write().await = Some(err);
                true
            }
        };
        if changed {
            shared.touch();
        }
    }
}
