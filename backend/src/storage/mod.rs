//! Storage layer for the transport's pending message queue.
//!
//! A store is the only state shared between the dev server's listener and its
//! drain worker, so every implementation must make enqueue and dequeue atomic
//! on its own.

mod json_storage;
mod memory_storage;
mod postgres_storage;

pub use json_storage::JsonFileStore;
pub use memory_storage::MemoryStore;
pub use postgres_storage::PostgresStore;

use crate::config::{SessionHandlerKind, TransportConfig};
use crate::environment::EnvironmentProfile;
use async_trait::async_trait;
use flod_types::JsonRpcMessage;
use std::sync::Arc;
use tracing::info;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Queue full: capacity {capacity}")]
    QueueFull { capacity: usize },

    #[error("Database store selected but no database_url configured")]
    MissingDatabaseUrl,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Bounded FIFO of inbound messages awaiting dispatch.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append messages in order, all or nothing.
    ///
    /// Fails with [`StoreError::QueueFull`] when the batch does not fit.
    async fn push_all(&self, messages: Vec<JsonRpcMessage>) -> Result<()>;

    /// Remove and return the oldest message, if any.
    async fn pop(&self) -> Result<Option<JsonRpcMessage>>;

    /// Number of queued messages.
    async fn len(&self) -> Result<usize>;

    /// Transport session id stored next to the queue, inserting `candidate`
    /// when none is stored yet.
    ///
    /// Processes that share the store agree on one id this way.
    async fn claim_session_id(&self, candidate: String) -> Result<String>;

    /// Replace the stored transport session id.
    async fn replace_session_id(&self, id: String) -> Result<()>;

    /// Append a single message.
    async fn push(&self, message: JsonRpcMessage) -> Result<()> {
        self.push_all(vec![message]).await
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Check that `incoming` more messages fit next to `queued` ones.
pub(crate) fn ensure_capacity(queued: usize, incoming: usize, capacity: usize) -> Result<()> {
    if queued + incoming > capacity {
        return Err(StoreError::QueueFull { capacity });
    }
    Ok(())
}

/// Concrete store kind for a configuration, resolving `auto`.
pub fn resolve_kind(config: &TransportConfig, profile: &EnvironmentProfile) -> SessionHandlerKind {
    match config.session_handler {
        SessionHandlerKind::Auto => {
            if config.database_url.is_some() {
                SessionHandlerKind::Database
            } else if profile.can_persist_state() {
                SessionHandlerKind::Memory
            } else {
                SessionHandlerKind::File
            }
        }
        kind => kind,
    }
}

/// Open the store selected by the configuration.
pub async fn open_store(
    config: &TransportConfig,
    profile: &EnvironmentProfile,
) -> Result<Arc<dyn MessageStore>> {
    let capacity = config.max_queue_size;
    let store: Arc<dyn MessageStore> = match resolve_kind(config, profile) {
        SessionHandlerKind::Database => {
            let url = config
                .database_url
                .as_deref()
                .ok_or(StoreError::MissingDatabaseUrl)?;
            let store = PostgresStore::new(url, capacity).await?;
            store.run_migrations().await?;
            Arc::new(store)
        }
        SessionHandlerKind::File => Arc::new(JsonFileStore::new(config.queue_file(), capacity)),
        SessionHandlerKind::Memory | SessionHandlerKind::Auto => Arc::new(MemoryStore::new(capacity)),
    };
    info!(
        "Pending message store ready ({:?}, capacity {})",
        resolve_kind(config, profile),
        capacity
    );
    Ok(store)
}
