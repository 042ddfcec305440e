//! JSON file-based store for processes that do not outlive a request.

use super::{ensure_capacity, MessageStore, Result, StoreError};
use async_trait::async_trait;
use flod_types::JsonRpcMessage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// JSON file storage format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StorageFormat {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    messages: VecDeque<JsonRpcMessage>,
}

impl Default for StorageFormat {
    fn default() -> Self {
        Self {
            version: 1,
            session_id: None,
            messages: VecDeque::new(),
        }
    }
}

/// Store that persists the queue to a JSON file.
///
/// Every operation is a read-modify-write of the whole file while holding an
/// exclusive advisory lock on a `.lock` file next to it, so concurrent
/// processes sharing the queue see each change whole. Writes go through a
/// temporary file in the same directory and a rename.
pub struct JsonFileStore {
    path: PathBuf,
    capacity: usize,
}

impl JsonFileStore {
    /// Create a new JSON file store.
    pub fn new(path: impl AsRef<Path>, capacity: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            capacity,
        }
    }

    /// Run `f` on the stored queue under the file lock.
    ///
    /// `f` returns its result and whether the queue must be written back.
    async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut StorageFormat) -> Result<(T, bool)> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || transact_blocking(&path, f))
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))?
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn transact_blocking<T>(
    path: &Path,
    f: impl FnOnce(&mut StorageFormat) -> Result<(T, bool)>,
) -> Result<T> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if !parent.exists() {
        fs::create_dir_all(parent)?;
        info!("Created queue directory: {}", parent.display());
    }

    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path(path))?;
    let mut lock = fd_lock::RwLock::new(lock_file);
    let _guard = lock.write()?;

    let mut storage = read_file(path)?;
    let (value, changed) = f(&mut storage)?;
    if changed {
        write_file(path, parent, &storage)?;
    }
    Ok(value)
}

fn read_file(path: &Path) -> Result<StorageFormat> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StorageFormat::default()),
        Err(e) => return Err(e.into()),
    };
    if contents.trim().is_empty() {
        return Ok(StorageFormat::default());
    }

    Ok(serde_json::from_str(&contents)?)
}

fn write_file(path: &Path, dir: &Path, storage: &StorageFormat) -> Result<()> {
    debug!(
        "Writing {} pending messages to {:?}",
        storage.messages.len(),
        path
    );

    let json = serde_json::to_string(storage)?;

    // Each writer gets its own temporary file; the rename is atomic
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(json.as_bytes())?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl MessageStore for JsonFileStore {
    async fn push_all(&self, messages: Vec<JsonRpcMessage>) -> Result<()> {
        let capacity = self.capacity;
        self.transact(move |storage| {
            ensure_capacity(storage.messages.len(), messages.len(), capacity)?;
            storage.messages.extend(messages);
            Ok(((), true))
        })
        .await
    }

    async fn pop(&self) -> Result<Option<JsonRpcMessage>> {
        self.transact(|storage| {
            let message = storage.messages.pop_front();
            let changed = message.is_some();
            Ok((message, changed))
        })
        .await
    }

    async fn len(&self) -> Result<usize> {
        self.transact(|storage| Ok((storage.messages.len(), false)))
            .await
    }

    async fn claim_session_id(&self, candidate: String) -> Result<String> {
        self.transact(move |storage| {
            if let Some(id) = &storage.session_id {
                return Ok((id.clone(), false));
            }
            storage.session_id = Some(candidate.clone());
            Ok((candidate, true))
        })
        .await
    }

    async fn replace_session_id(&self, id: String) -> Result<()> {
        self.transact(move |storage| {
            storage.session_id = Some(id);
            Ok(((), true))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;
    use flod_types::JsonRpcRequest;
    use tempfile::TempDir;

    fn request(id: i64) -> JsonRpcMessage {
        JsonRpcRequest::new(id, "ping", None).into()
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("queue").join("pending.json");

        let store = JsonFileStore::new(&path, 10);
        store.push_all(vec![request(1), request(2)]).await.unwrap();
        assert!(path.exists());

        // A second handle on the same file, as a later CGI process would open
        let reopened = JsonFileStore::new(&path, 10);
        assert_eq!(reopened.len().await.unwrap(), 2);
        assert_eq!(reopened.pop().await.unwrap(), Some(request(1)));
        assert_eq!(store.pop().await.unwrap(), Some(request(2)));
        assert_eq!(store.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_capacity() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("pending.json"), 1);

        store.push(request(1)).await.unwrap();
        assert!(matches!(
            store.push(request(2)).await,
            Err(StoreError::QueueFull { capacity: 1 })
        ));
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_session_id_survives_queue_changes_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pending.json");

        let store = JsonFileStore::new(&path, 10);
        assert_eq!(store.claim_session_id("first".into()).await.unwrap(), "first");
        store.push(request(1)).await.unwrap();
        store.pop().await.unwrap();

        let reopened = JsonFileStore::new(&path, 10);
        assert_eq!(
            reopened.claim_session_id("second".into()).await.unwrap(),
            "first"
        );

        reopened.replace_session_id("third".into()).await.unwrap();
        assert_eq!(store.claim_session_id("x".into()).await.unwrap(), "third");
    }

    #[tokio::test]
    async fn test_concurrent_handles_lose_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pending.json");

        let mut tasks = Vec::new();
        for id in 0..20 {
            // A fresh handle per writer, as separate CGI processes would have
            let store = JsonFileStore::new(&path, 100);
            tasks.push(tokio::spawn(async move { store.push(request(id)).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let store = JsonFileStore::new(&path, 100);
        assert_eq!(store.len().await.unwrap(), 20);

        let mut popped = Vec::new();
        while let Some(message) = store.pop().await.unwrap() {
            popped.push(message);
        }
        assert_eq!(popped.len(), 20);
        for id in 0..20 {
            assert!(popped.contains(&request(id)));
        }

        // Only the queue and its lock file are left behind
        let mut names: Vec<String> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["pending.json", "pending.json.lock"]);
    }

    #[tokio::test]
    async fn test_empty_file_reads_as_empty_queue() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pending.json");
        std::fs::write(&path, "  \n").unwrap();

        let store = JsonFileStore::new(&path, 5);
        assert_eq!(store.pop().await.unwrap(), None);
    }
}
