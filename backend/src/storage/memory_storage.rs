//! In-memory store for long-lived processes.

use super::{ensure_capacity, MessageStore, Result};
use async_trait::async_trait;
use flod_types::JsonRpcMessage;
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// Store that keeps the queue in process memory.
pub struct MemoryStore {
    queue: Mutex<VecDeque<JsonRpcMessage>>,
    session_id: Mutex<Option<String>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            session_id: Mutex::new(None),
            capacity,
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn push_all(&self, messages: Vec<JsonRpcMessage>) -> Result<()> {
        let mut queue = self.queue.lock().await;
        ensure_capacity(queue.len(), messages.len(), self.capacity)?;
        queue.extend(messages);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<JsonRpcMessage>> {
        Ok(self.queue.lock().await.pop_front())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.queue.lock().await.len())
    }

    async fn claim_session_id(&self, candidate: String) -> Result<String> {
        Ok(self
            .session_id
            .lock()
            .await
            .get_or_insert(candidate)
            .clone())
    }

    async fn replace_session_id(&self, id: String) -> Result<()> {
        *self.session_id.lock().await = Some(id);
        Ok(())
    }
}
