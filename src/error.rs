use std::time::Duration;

use thiserror::Error;

use crate::transport::ConnectionState;

/// A server payload that could not be normalised into a [`crate::ChatMessage`].
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Socket or protocol failure. Handled inside the transport session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no access token available")]
    MissingToken,
    #[error("token rejected: {0}")]
    Rejected(String),
    #[error("credential refresh failed")]
    RefreshFailed,
}

/// Terminal failure of a transport session, reported once to its owner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("gave up reconnecting after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: TransportError },
}

/// REST failure on a page, context, search or translation call.
///
/// Reported to the caller; the loaded buffer is left untouched.
#[derive(Error, Debug)]
pub enum HistoryFetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {status}: {message}")]
    Status { status: u16, message: String },
    #[error("request unauthorized")]
    Unauthorized,
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// A command refused before or during dispatch. Not retried automatically.
#[derive(Error, Debug)]
pub enum CommandRejected {
    #[error("message is blank")]
    BlankMessage,
    #[error("session is not connected ({0:?})")]
    NotConnected(ConnectionState),
    #[error("publish failed: {0}")]
    PublishFailed(TransportError),
    #[error("delete fallback failed: {0}")]
    DeleteFallback(HistoryFetchError),
}
