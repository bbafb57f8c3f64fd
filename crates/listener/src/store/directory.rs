//! Shared-directory durable backend.
//!
//! Intended for a directory every node mounts (NFS, a shared volume). The
//! compare-and-swap is serialized by an exclusive lock file created with
//! `O_CREAT | O_EXCL` and holding its owner's token; changes are discovered
//! by polling.
//!
//! ```text
//! <dir>/
//! ├── certmesh-serving.json   # current slot document
//! └── certmesh-serving.lock   # present only while a writer holds the slot
//! ```

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use certmesh_common::SlotKey;

use super::file::write_atomic;
use super::{salvage_revision, DocumentStream, DurableBackend, PutOutcome};
use crate::errors::StoreError;
use crate::record::SlotDocument;

/// Locks older than this are assumed abandoned by a crashed writer
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// How long a writer waits for the lock before giving up
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    dir: PathBuf,
    poll_interval: Duration,
}

impl DirectoryBackend {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: poll_interval.max(Duration::from_millis(10)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, key: &SlotKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.file_stem()))
    }

    fn lock_path(&self, key: &SlotKey) -> PathBuf {
        self.dir.join(format!("{}.lock", key.file_stem()))
    }

    async fn read(&self, key: &SlotKey) -> Result<Option<SlotDocument>, StoreError> {
        let bytes = match tokio::fs::read(self.slot_path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::CorruptSlot {
                key: key.to_string(),
                revision: salvage_revision(&bytes),
                reason: e.to_string(),
            })
    }

    async fn acquire_lock(&self, key: &SlotKey) -> Result<LockGuard, StoreError> {
        let path = self.lock_path(key);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + LOCK_TIMEOUT;

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let written = match file.write_all(token.as_bytes()).await {
                        Ok(()) => file.sync_all().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = written {
                        let _ = tokio::fs::remove_file(&path).await;
                        return Err(e.into());
                    }
                    trace!(lock = %path.display(), "Acquired slot lock");
                    return Ok(LockGuard { path, token });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(stale_token) = stale_lock_token(&path).await {
                        break_stale_lock(&path, &stale_token).await;
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::Backend(format!(
                            "timed out waiting for lock {}",
                            path.display()
                        )));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_stale(metadata: &std::fs::Metadata) -> bool {
    metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

/// Owner token of the lock at `path` if the lock is abandoned
async fn stale_lock_token(path: &Path) -> Option<String> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    if !is_stale(&metadata) {
        return None;
    }
    tokio::fs::read_to_string(path).await.ok()
}

/// Remove an abandoned lock without disturbing a fresh one.
///
/// The lock is first renamed to a private name, so at most one writer moves
/// any given lock file. If what was moved is not the abandoned lock (another
/// writer broke it and took the lock in between) it is linked back in place.
async fn break_stale_lock(path: &Path, stale_token: &str) {
    let quarantine = path.with_extension(format!("lock.{}", Uuid::new_v4().simple()));
    if tokio::fs::rename(path, &quarantine).await.is_err() {
        // Already broken by someone else
        return;
    }

    let token = tokio::fs::read_to_string(&quarantine).await.ok();
    let still_stale = tokio::fs::metadata(&quarantine)
        .await
        .is_ok_and(|metadata| is_stale(&metadata));

    if token.as_deref() == Some(stale_token) && still_stale {
        warn!(lock = %path.display(), "Broke stale slot lock");
    } else if let Err(e) = tokio::fs::hard_link(&quarantine, path).await {
        warn!(lock = %path.display(), error = %e, "Failed to restore a live slot lock");
    } else {
        debug!(lock = %path.display(), "Restored a live slot lock moved while breaking a stale one");
    }

    let _ = tokio::fs::remove_file(&quarantine).await;
}

/// Holds the slot lock; removes it when dropped if it still carries our token
struct LockGuard {
    path: PathBuf,
    token: String,
}

impl LockGuard {
    async fn is_held(&self) -> bool {
        tokio::fs::read_to_string(&self.path)
            .await
            .is_ok_and(|token| token == self.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(token) if token == self.token => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(lock = %self.path.display(), error = %e, "Failed to release slot lock");
                }
            }
            Ok(_) => warn!(lock = %self.path.display(), "Slot lock was taken over, leaving it in place"),
            Err(e) => warn!(lock = %self.path.display(), error = %e, "Slot lock disappeared before release"),
        }
    }
}

#[async_trait]
impl DurableBackend for DirectoryBackend {
    async fn get(&self, key: &SlotKey) -> Result<Option<SlotDocument>, StoreError> {
        self.read(key).await
    }

    async fn conditional_put(
        &self,
        key: &SlotKey,
        mut document: SlotDocument,
        expected_revision: u64,
    ) -> Result<PutOutcome, StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let lock = self.acquire_lock(key).await?;

        let current_revision = match self.read(key).await {
            Ok(current) => current.map_or(0, |d| d.revision),
            Err(StoreError::CorruptSlot { revision, .. }) => revision,
            Err(e) => return Err(e),
        };

        if current_revision != expected_revision {
            return Ok(PutOutcome::Conflict { current_revision });
        }

        if !lock.is_held().await {
            return Err(StoreError::Backend(format!(
                "lost lock {} before writing",
                lock.path.display()
            )));
        }

        document.revision = expected_revision + 1;
        let content = serde_json::to_vec_pretty(&document)?;
        write_atomic(&self.slot_path(key), &content).await?;

        debug!(
            slot = %key,
            revision = document.revision,
            dir = %self.dir.display(),
            "Wrote durable slot"
        );
        Ok(PutOutcome::Saved(document.revision))
    }

    fn watch_changes(&self, key: &SlotKey) -> DocumentStream {
        let state = (self.clone(), key.clone(), None::<Interval>, 0u64);

        stream::unfold(state, |(backend, key, ticker, mut last)| async move {
            let mut ticker = ticker.unwrap_or_else(|| {
                let mut ticker = interval(backend.poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            loop {
                ticker.tick().await;
                match backend.read(&key).await {
                    Ok(Some(document)) if document.revision > last => {
                        last = document.revision;
                        return Some((document, (backend, key, Some(ticker), last)));
                    }
                    Ok(_) => {}
                    Err(StoreError::CorruptSlot { revision, .. }) => {
                        trace!(slot = %key, revision, "Skipping corrupt slot while polling");
                    }
                    Err(e) => {
                        warn!(slot = %key, error = %e, "Failed to poll durable slot");
                    }
                }
            }
        })
        .boxed()
    }

    fn name(&self) -> &'static str {
        "directory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certmesh_common::WriterId;
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn document() -> SlotDocument {
        SlotDocument {
            revision: 0,
            certificate: "cert".to_string(),
            key: "key".to_string(),
            written_by: WriterId::from_string("test"),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let dir = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(dir.path().join("shared"), Duration::from_millis(20));
        let key = SlotKey::default();

        assert!(backend.get(&key).await.unwrap().is_none());
        assert_eq!(
            backend.conditional_put(&key, document(), 0).await.unwrap(),
            PutOutcome::Saved(1)
        );
        assert_eq!(
            backend.conditional_put(&key, document(), 0).await.unwrap(),
            PutOutcome::Conflict { current_revision: 1 }
        );
        assert_eq!(backend.get(&key).await.unwrap().unwrap().revision, 1);
        assert!(!backend.lock_path(&key).exists());
    }

    #[tokio::test]
    async fn test_racing_puts_have_one_winner() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(DirectoryBackend::new(dir.path(), Duration::from_millis(20)));
        let key = SlotKey::default();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let backend = backend.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                backend.conditional_put(&key, document(), 0).await.unwrap()
            }));
        }

        let mut saved = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), PutOutcome::Saved(_)) {
                saved += 1;
            }
        }
        assert_eq!(saved, 1);
    }

    #[tokio::test]
    async fn test_corrupt_slot_reports_revision() {
        let dir = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(dir.path(), Duration::from_millis(20));
        let key = SlotKey::default();

        std::fs::write(
            backend.slot_path(&key),
            br#"{"revision": 5, "certificate": 1}"#,
        )
        .unwrap();

        let err = backend.get(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptSlot { revision: 5, .. }));

        // The corrupt revision can be overwritten with a compare-and-swap
        assert_eq!(
            backend.conditional_put(&key, document(), 5).await.unwrap(),
            PutOutcome::Saved(6)
        );
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(dir.path(), Duration::from_millis(20));
        let key = SlotKey::default();

        let lock = backend.lock_path(&key);
        let file = std::fs::File::create(&lock).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(120))
            .unwrap();
        drop(file);

        assert_eq!(
            backend.conditional_put(&key, document(), 0).await.unwrap(),
            PutOutcome::Saved(1)
        );
    }

    fn stale_lock(path: &Path, token: &str) {
        std::fs::write(path, token).unwrap();
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(120))
            .unwrap();
    }

    fn leftover_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| !name.ends_with(".json"))
            .collect()
    }

    #[tokio::test]
    async fn test_writers_racing_a_stale_lock_have_one_winner() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(DirectoryBackend::new(dir.path(), Duration::from_millis(20)));
        let key = SlotKey::default();
        stale_lock(&backend.lock_path(&key), "crashed-writer");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let backend = backend.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                backend.conditional_put(&key, document(), 0).await
            }));
        }

        let mut saved = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(PutOutcome::Saved(revision)) => {
                    assert_eq!(revision, 1);
                    saved += 1;
                }
                Ok(PutOutcome::Conflict { current_revision }) => assert_eq!(current_revision, 1),
                Err(e) => assert!(matches!(e, StoreError::Backend(_)), "{e}"),
            }
        }

        assert_eq!(saved, 1);
        assert_eq!(backend.get(&key).await.unwrap().unwrap().revision, 1);
        assert!(leftover_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_breaking_a_live_lock_puts_it_back() {
        let dir = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(dir.path(), Duration::from_millis(20));
        let lock = backend.lock_path(&SlotKey::default());

        // Same token as the abandoned lock we saw, but freshly taken
        std::fs::write(&lock, "writer-a").unwrap();
        break_stale_lock(&lock, "writer-a").await;

        assert_eq!(std::fs::read_to_string(&lock).unwrap(), "writer-a");
        assert_eq!(leftover_files(dir.path()), vec!["certmesh-serving.lock"]);
    }

    #[tokio::test]
    async fn test_lock_guard_only_releases_its_own_lock() {
        let dir = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(dir.path(), Duration::from_millis(20));
        let key = SlotKey::default();
        let lock = backend.lock_path(&key);

        let guard = backend.acquire_lock(&key).await.unwrap();
        assert!(guard.is_held().await);
        drop(guard);
        assert!(!lock.exists());

        let guard = backend.acquire_lock(&key).await.unwrap();
        std::fs::write(&lock, "writer-b").unwrap();
        assert!(!guard.is_held().await);
        drop(guard);
        assert_eq!(std::fs::read_to_string(&lock).unwrap(), "writer-b");
    }

    #[tokio::test]
    async fn test_watch_polls_new_revisions() {
        let dir = TempDir::new().unwrap();
        let backend = DirectoryBackend::new(dir.path(), Duration::from_millis(10));
        let key = SlotKey::default();
        let mut changes = backend.watch_changes(&key);

        backend.conditional_put(&key, document(), 0).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.revision, 1);

        backend.conditional_put(&key, document(), 1).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.revision, 2);
    }
}
