//! Realtime chat room engine: a reconnecting pub/sub session, an ordered
//! message buffer paged from REST history, keyword search navigation and a
//! translation display mode.

pub mod backoff;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod messages;
pub mod model;
pub mod room;
pub mod search;
pub mod store;
pub mod transport;
pub mod translation;

pub use config::SessionConfig;
pub use credentials::{CredentialProvider, MemoryCredentials};
pub use dispatch::{CommandDispatcher, ConfirmedDelete, DeleteRequest};
pub use error::{AuthError, CommandRejected, HistoryFetchError, PayloadError, SessionError, TransportError};
pub use history::{HistoryApi, HttpHistoryApi, PageCursor};
pub use model::{ChatMessage, MessageId, RoomId, UserId};
pub use room::{DisplayMessage, RoomSession};
pub use search::{RoomSearchSession, SearchNavigator};
pub use store::{LoadOutcome, MessageStore};
pub use transport::{ConnectionState, Connector, Link, TransportEvent, TransportSession, WsConnector};
pub use translation::TranslationMode;
