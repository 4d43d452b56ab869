//! The ordered message buffer for one room.
//!
//! Messages are kept newest first, strictly descending by id, with no
//! duplicate ids. Page loads are split into `begin_*` / `finish_*` halves so
//! the network call can run without holding the store; every `begin_*` hands
//! out a [`PageTicket`] stamped with the store generation, and a ticket from
//! an older generation is discarded on `finish_*`.

use log::debug;

use crate::history::PageCursor;
use crate::model::{ChatMessage, MessageId, RoomId};

/// What a page load did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// This many messages were added.
    Applied(usize),
    /// The server had nothing further in that direction.
    Exhausted,
    /// No request was issued: one is already in flight or the direction is exhausted.
    Skipped,
    /// The response arrived for a superseded generation and was dropped.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTicket {
    pub generation: u64,
    pub cursor: PageCursor,
}

#[derive(Debug)]
pub struct MessageStore {
    room_id: RoomId,
    messages: Vec<ChatMessage>,
    generation: u64,
    older_exhausted: bool,
    at_head: bool,
    loading_older: bool,
    loading_newer: bool,
}

impl MessageStore {
    pub fn new(room_id: RoomId) -> Self {
        MessageStore {
            room_id,
            messages: Vec::new(),
            generation: 0,
            older_exhausted: false,
            at_head: true,
            loading_older: false,
            loading_newer: false,
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|m| m.id).collect()
    }

    pub fn get(&self, id: MessageId) -> Option<&ChatMessage> {
        self.position(id).ok().map(|pos| &self.messages[pos])
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_more_older(&self) -> bool {
        !self.older_exhausted
    }

    /// Whether the buffer reaches the newest message of the room.
    pub fn is_at_head(&self) -> bool {
        self.at_head
    }

    pub fn is_loading_older(&self) -> bool {
        self.loading_older
    }

    /// Starts a new generation; results of every in-flight load are dropped.
    pub fn invalidate(&mut self) -> u64 {
        self.generation += 1;
        self.loading_older = false;
        self.loading_newer = false;
        self.generation
    }

    pub fn begin_initial(&mut self) -> PageTicket {
        PageTicket {
            generation: self.invalidate(),
            cursor: PageCursor::Head,
        }
    }

    pub fn finish_initial(&mut self, ticket: PageTicket, page: Vec<ChatMessage>) -> LoadOutcome {
        if ticket.generation != self.generation {
            return LoadOutcome::Discarded;
        }
        self.replace(page);
        self.at_head = true;
        LoadOutcome::Applied(self.messages.len())
    }

    /// Reserves the older-page slot. `None` while a load is pending, after the
    /// history ran out, or when there is nothing to page from.
    pub fn begin_older(&mut self) -> Option<PageTicket> {
        if self.loading_older || self.older_exhausted {
            return None;
        }
        let oldest = self.messages.last()?.id;
        self.loading_older = true;
        Some(PageTicket {
            generation: self.generation,
            cursor: PageCursor::Before(oldest),
        })
    }

    pub fn finish_older(&mut self, ticket: PageTicket, page: Vec<ChatMessage>) -> LoadOutcome {
        if ticket.generation != self.generation {
            return LoadOutcome::Discarded;
        }
        self.loading_older = false;

        let oldest = self.messages.last().map_or(MessageId::MAX, |m| m.id);
        let fresh: Vec<ChatMessage> = page
            .into_iter()
            .filter(|m| m.room_id == self.room_id && m.id < oldest)
            .collect();
        if fresh.is_empty() {
            debug!("room {}: no history older than {oldest}", self.room_id);
            self.older_exhausted = true;
            return LoadOutcome::Exhausted;
        }

        let added = fresh.len();
        self.messages.extend(fresh);
        self.normalize();
        LoadOutcome::Applied(added)
    }

    /// Releases the older-page slot after a failed request.
    pub fn abort_older(&mut self, ticket: PageTicket) {
        if ticket.generation == self.generation {
            self.loading_older = false;
        }
    }

    pub fn begin_newer(&mut self) -> Option<PageTicket> {
        if self.loading_newer || self.at_head {
            return None;
        }
        let newest = self.messages.first()?.id;
        self.loading_newer = true;
        Some(PageTicket {
            generation: self.generation,
            cursor: PageCursor::After(newest),
        })
    }

    pub fn finish_newer(&mut self, ticket: PageTicket, page: Vec<ChatMessage>) -> LoadOutcome {
        if ticket.generation != self.generation {
            return LoadOutcome::Discarded;
        }
        self.loading_newer = false;

        let newest = self.messages.first().map_or(MessageId::MIN, |m| m.id);
        let fresh: Vec<ChatMessage> = page
            .into_iter()
            .filter(|m| m.room_id == self.room_id && m.id > newest)
            .collect();
        if fresh.is_empty() {
            self.at_head = true;
            return LoadOutcome::Exhausted;
        }

        let added = fresh.len();
        self.messages.extend(fresh);
        self.normalize();
        LoadOutcome::Applied(added)
    }

    pub fn abort_newer(&mut self, ticket: PageTicket) {
        if ticket.generation == self.generation {
            self.loading_newer = false;
        }
    }

    pub fn begin_window(&mut self) -> u64 {
        self.invalidate()
    }

    pub fn finish_window(&mut self, generation: u64, page: Vec<ChatMessage>) -> LoadOutcome {
        if generation != self.generation {
            return LoadOutcome::Discarded;
        }
        self.replace_window(page);
        LoadOutcome::Applied(self.messages.len())
    }

    /// Swaps the whole buffer for a context window around a search hit.
    pub fn replace_window(&mut self, page: Vec<ChatMessage>) {
        self.replace(page);
        self.at_head = false;
    }

    /// Inserts a pushed message. Returns `false` for a duplicate id, a message
    /// from another room, or one newer than a window detached from the head.
    pub fn apply_inbound(&mut self, message: ChatMessage) -> bool {
        if message.room_id != self.room_id {
            return false;
        }
        if !self.at_head && self.messages.first().is_some_and(|m| message.id > m.id) {
            // Picked up by load_newer once the window reaches the head.
            return false;
        }
        match self.position(message.id) {
            Ok(_) => false,
            Err(pos) => {
                self.messages.insert(pos, message);
                true
            }
        }
    }

    /// Removes a message if it is loaded.
    pub fn apply_delete(&mut self, id: MessageId) -> bool {
        match self.position(id) {
            Ok(pos) => {
                self.messages.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    fn replace(&mut self, page: Vec<ChatMessage>) {
        let room_id = self.room_id;
        self.messages = page.into_iter().filter(|m| m.room_id == room_id).collect();
        self.normalize();
        self.older_exhausted = false;
    }

    fn normalize(&mut self) {
        self.messages.sort_by(|a, b| b.id.cmp(&a.id));
        self.messages.dedup_by_key(|m| m.id);
    }

    fn position(&self, id: MessageId) -> Result<usize, usize> {
        self.messages.binary_search_by(|m| id.cmp(&m.id))
    }
}
