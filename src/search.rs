use std::ops::Range;

use crate::model::MessageId;

/// An open keyword search over the full room history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSearchSession {
    keyword: String,
    matches: Vec<MessageId>,
    cursor: Option<usize>,
}

impl RoomSearchSession {
    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    /// Matching ids in server order; index 0 is the most relevant.
    pub fn matches(&self) -> &[MessageId] {
        &self.matches
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn current(&self) -> Option<MessageId> {
        self.cursor.and_then(|i| self.matches.get(i).copied())
    }
}

/// Holds the search session and moves its cursor. Stepping is bounded at
/// both ends of the match list; there is no wraparound.
#[derive(Debug, Default)]
pub struct SearchNavigator {
    session: Option<RoomSearchSession>,
}

impl SearchNavigator {
    pub fn session(&self) -> Option<&RoomSearchSession> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Opens a session and returns the first match to center on, if any.
    pub fn begin(&mut self, keyword: &str, matches: Vec<MessageId>) -> Option<MessageId> {
        let cursor = if matches.is_empty() { None } else { Some(0) };
        let session = RoomSearchSession {
            keyword: keyword.to_string(),
            matches,
            cursor,
        };
        let first = session.current();
        self.session = Some(session);
        first
    }

    /// The next match toward the end of the list (older, in recency order).
    pub fn peek_backward(&self) -> Option<(usize, MessageId)> {
        let session = self.session.as_ref()?;
        let next = session.cursor? + 1;
        session.matches.get(next).map(|&id| (next, id))
    }

    /// The previous match toward index 0.
    pub fn peek_forward(&self) -> Option<(usize, MessageId)> {
        let session = self.session.as_ref()?;
        let prev = session.cursor?.checked_sub(1)?;
        session.matches.get(prev).map(|&id| (prev, id))
    }

    /// Moves the cursor to `index`. Out-of-range indexes are ignored.
    pub fn commit(&mut self, index: usize) {
        if let Some(session) = self.session.as_mut() {
            if index < session.matches.len() {
                session.cursor = Some(index);
            }
        }
    }

    pub fn step_backward(&mut self) -> Option<MessageId> {
        let (index, id) = self.peek_backward()?;
        self.commit(index);
        Some(id)
    }

    pub fn step_forward(&mut self) -> Option<MessageId> {
        let (index, id) = self.peek_forward()?;
        self.commit(index);
        Some(id)
    }

    /// Ends the session. Returns whether one was open.
    pub fn close(&mut self) -> bool {
        self.session.take().is_some()
    }

    /// Byte ranges of `text` to emphasize. Only the message under the cursor
    /// is highlighted; every other message renders plain.
    pub fn highlight(&self, message_id: MessageId, text: &str) -> Vec<Range<usize>> {
        match self.session.as_ref() {
            Some(session) if session.current() == Some(message_id) => {
                keyword_ranges(text, &session.keyword)
            }
            _ => Vec::new(),
        }
    }
}

/// Non-overlapping ASCII-case-insensitive occurrences of `keyword` in `text`.
fn keyword_ranges(text: &str, keyword: &str) -> Vec<Range<usize>> {
    if keyword.is_empty() {
        return Vec::new();
    }
    // ASCII lowering keeps byte offsets, so ranges map straight back onto `text`.
    let haystack = text.to_ascii_lowercase();
    let needle = keyword.to_ascii_lowercase();
    haystack
        .match_indices(&needle)
        .map(|(start, found)| start..start + found.len())
        .collect()
}
