//! REST access to room history, search and translation settings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Value};

use crate::credentials::CredentialProvider;
use crate::error::HistoryFetchError;
use crate::model::{ChatMessage, MessageId, RoomId};
use crate::translation::TranslationMode;

const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Which page of history to fetch, relative to an anchor message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCursor {
    /// The newest page of the room.
    Head,
    /// The page strictly older than the given id.
    Before(MessageId),
    /// The page strictly newer than the given id.
    After(MessageId),
}

/// History endpoints consumed by a room session. Every page is newest first.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    async fn history(
        &self,
        room_id: RoomId,
        cursor: PageCursor,
        mode: TranslationMode,
    ) -> Result<Vec<ChatMessage>, HistoryFetchError>;

    async fn set_translation(&self, room_id: RoomId, enabled: bool) -> Result<(), HistoryFetchError>;

    async fn context_around(
        &self,
        room_id: RoomId,
        message_id: MessageId,
    ) -> Result<Vec<ChatMessage>, HistoryFetchError>;

    /// Messages matching `keyword` in the server's ranking order.
    async fn search(&self, room_id: RoomId, keyword: &str) -> Result<Vec<ChatMessage>, HistoryFetchError>;

    async fn delete_message(&self, room_id: RoomId, message_id: MessageId) -> Result<(), HistoryFetchError>;
}

/// [`HistoryApi`] over HTTP with bearer auth.
///
/// A 401 triggers one credential refresh and one retry of the same request.
#[derive(Clone)]
pub struct HttpHistoryApi {
    base_url: Url,
    http: Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpHistoryApi {
    pub fn new(base_url: &str, credentials: Arc<dyn CredentialProvider>) -> Result<Self, HistoryFetchError> {
        // Url::join drops the last segment unless the base ends with '/'.
        let base_url = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(HttpHistoryApi {
            base_url,
            http,
            credentials,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, HistoryFetchError> {
        Ok(self.base_url.join(path)?)
    }

    fn history_url(
        &self,
        room_id: RoomId,
        cursor: PageCursor,
        mode: TranslationMode,
    ) -> Result<Url, HistoryFetchError> {
        let path = match mode {
            TranslationMode::Off => format!("rooms/{room_id}/messages"),
            TranslationMode::On => format!("rooms/{room_id}/messages/translated"),
        };
        let mut url = self.endpoint(&path)?;
        match cursor {
            PageCursor::Head => {}
            PageCursor::Before(id) => {
                url.query_pairs_mut().append_pair("before", &id.to_string());
            }
            PageCursor::After(id) => {
                url.query_pairs_mut().append_pair("after", &id.to_string());
            }
        }
        Ok(url)
    }

    async fn send<F>(&self, build: F) -> Result<Response, HistoryFetchError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self
            .credentials
            .token()
            .await
            .ok_or(HistoryFetchError::Unauthorized)?;
        let response = build(&self.http).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        warn!("History API rejected the access token, refreshing");
        let token = self
            .credentials
            .refresh()
            .await
            .ok_or(HistoryFetchError::Unauthorized)?;
        let response = build(&self.http).bearer_auth(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(HistoryFetchError::Unauthorized);
        }
        check_status(response).await
    }

    async fn fetch_messages(&self, url: Url) -> Result<Vec<ChatMessage>, HistoryFetchError> {
        debug!("GET {url}");
        let response = self.send(|http| http.get(url.clone())).await?;
        let body: Value = response.json().await?;
        parse_page(body)
    }
}

async fn check_status(response: Response) -> Result<Response, HistoryFetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(HistoryFetchError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Accepts a bare array or one wrapped in `{"data": [...]}`.
fn parse_page(body: Value) -> Result<Vec<ChatMessage>, HistoryFetchError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(HistoryFetchError::Status {
                    status: 200,
                    message: "response carries no message list".to_string(),
                })
            }
        },
        _ => Vec::new(),
    };
    items
        .into_iter()
        .map(|item| ChatMessage::from_value(item).map_err(HistoryFetchError::from))
        .collect()
}

#[async_trait]
impl HistoryApi for HttpHistoryApi {
    async fn history(
        &self,
        room_id: RoomId,
        cursor: PageCursor,
        mode: TranslationMode,
    ) -> Result<Vec<ChatMessage>, HistoryFetchError> {
        let url = self.history_url(room_id, cursor, mode)?;
        self.fetch_messages(url).await
    }

    async fn set_translation(&self, room_id: RoomId, enabled: bool) -> Result<(), HistoryFetchError> {
        let url = self.endpoint(&format!("rooms/{room_id}/translation"))?;
        debug!("PUT {url} enabled={enabled}");
        self.send(|http| http.put(url.clone()).json(&json!({ "enabled": enabled })))
            .await?;
        Ok(())
    }

    async fn context_around(
        &self,
        room_id: RoomId,
        message_id: MessageId,
    ) -> Result<Vec<ChatMessage>, HistoryFetchError> {
        let url = self.endpoint(&format!("rooms/{room_id}/messages/{message_id}/context"))?;
        self.fetch_messages(url).await
    }

    async fn search(&self, room_id: RoomId, keyword: &str) -> Result<Vec<ChatMessage>, HistoryFetchError> {
        let mut url = self.endpoint(&format!("rooms/{room_id}/messages/search"))?;
        url.query_pairs_mut().append_pair("keyword", keyword);
        self.fetch_messages(url).await
    }

    async fn delete_message(&self, room_id: RoomId, message_id: MessageId) -> Result<(), HistoryFetchError> {
        let url = self.endpoint(&format!("rooms/{room_id}/messages/{message_id}"))?;
        debug!("DELETE {url}");
        self.send(|http| http.delete(url.clone())).await?;
        Ok(())
    }
}
