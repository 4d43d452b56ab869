use std::sync::Arc;

use log::{debug, warn};

use crate::error::CommandRejected;
use crate::history::HistoryApi;
use crate::messages::{DeleteCommand, SendCommand, DELETE_DESTINATION, SEND_DESTINATION};
use crate::model::{MessageId, RoomId, UserId};
use crate::transport::{ConnectionState, TransportSession};

/// A delete the user has asked for but not yet confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteRequest {
    message_id: MessageId,
}

impl DeleteRequest {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn confirm(self) -> ConfirmedDelete {
        ConfirmedDelete {
            message_id: self.message_id,
        }
    }
}

/// Only obtainable through [`DeleteRequest::confirm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmedDelete {
    message_id: MessageId,
}

impl ConfirmedDelete {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

/// Turns send/delete intents into publishes.
///
/// Nothing is applied to the local buffer here: sent messages show up through
/// the inbox echo and deletions through the room broadcast echo.
pub struct CommandDispatcher {
    transport: Arc<TransportSession>,
    history: Arc<dyn HistoryApi>,
    room_id: RoomId,
    sender_id: UserId,
}

impl CommandDispatcher {
    pub fn new(
        transport: Arc<TransportSession>,
        history: Arc<dyn HistoryApi>,
        room_id: RoomId,
        sender_id: UserId,
    ) -> Self {
        CommandDispatcher {
            transport,
            history,
            room_id,
            sender_id,
        }
    }

    /// Publishes `text` to the room. On error the caller still owns `text`
    /// and can offer it for resubmission.
    pub async fn send_message(&self, text: &str) -> Result<(), CommandRejected> {
        if text.trim().is_empty() {
            return Err(CommandRejected::BlankMessage);
        }
        let state = self.transport.state();
        if state != ConnectionState::Connected {
            return Err(CommandRejected::NotConnected(state));
        }

        let command = SendCommand {
            room_id: self.room_id,
            sender_id: self.sender_id,
            content: text.to_string(),
        };
        self.transport
            .publish(SEND_DESTINATION, &command)
            .await
            .map_err(CommandRejected::PublishFailed)?;
        debug!("Published message to room {}", self.room_id);
        Ok(())
    }

    pub fn prepare_delete(&self, message_id: MessageId) -> DeleteRequest {
        DeleteRequest { message_id }
    }

    /// Publishes a delete, falling back to the REST endpoint when the socket
    /// is down or the publish fails after its retry.
    pub async fn delete_message(&self, confirmed: ConfirmedDelete) -> Result<(), CommandRejected> {
        let message_id = confirmed.message_id;
        if self.transport.state() == ConnectionState::Connected {
            let command = DeleteCommand {
                message_id,
                sender_id: self.sender_id,
            };
            match self.transport.publish(DELETE_DESTINATION, &command).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!("Delete publish for {message_id} failed ({e}), using REST"),
            }
        }
        self.history
            .delete_message(self.room_id, message_id)
            .await
            .map_err(CommandRejected::DeleteFallback)
    }
}
