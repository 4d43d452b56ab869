use async_trait::async_trait;
use tokio::sync::RwLock;

/// Source of the access token shared by every room.
///
/// Sessions only read the token and ask for a refresh; persisting the
/// refreshed value is the provider's job. `refresh` fails closed and returns
/// `None` when no fresh token could be obtained.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn token(&self) -> Option<String>;
    async fn refresh(&self) -> Option<String>;
    async fn clear(&self);
}

/// Holds a fixed token with no way to refresh it.
pub struct MemoryCredentials {
    token: RwLock<Option<String>>,
}

impl MemoryCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        MemoryCredentials {
            token: RwLock::new(Some(token.into())),
        }
    }
}

#[async_trait]
impl CredentialProvider for MemoryCredentials {
    async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    async fn refresh(&self) -> Option<String> {
        // A rejected static token cannot be renewed.
        self.clear().await;
        None
    }

    async fn clear(&self) {
        *self.token.write().await = None;
    }
}
