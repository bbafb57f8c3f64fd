//! In-process tiers.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{future, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::trace;

use certmesh_common::SlotKey;

use super::{DocumentStream, DurableBackend, PutOutcome};
use crate::errors::StoreError;
use crate::record::{SlotDocument, StorageSlot};

/// Memory cache tier
#[derive(Debug, Default)]
pub struct MemoryTier {
    slots: DashMap<SlotKey, StorageSlot>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SlotKey) -> Option<StorageSlot> {
        self.slots.get(key).map(|entry| entry.value().clone())
    }

    pub fn put(&self, key: &SlotKey, slot: StorageSlot) {
        self.slots.insert(key.clone(), slot);
    }

    /// Store `slot` unless an equal or newer revision is cached.
    ///
    /// Returns `true` if the cache changed.
    pub fn put_if_newer(&self, key: &SlotKey, slot: StorageSlot) -> bool {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().revision < slot.revision {
                    entry.insert(slot);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(slot);
                true
            }
        }
    }

    pub fn evict(&self, key: &SlotKey) {
        self.slots.remove(key);
    }
}

/// In-process durable backend.
///
/// Shared between coordinators in one process (single node deployments and
/// tests). Each slot is a `watch` channel, so the compare-and-swap and the
/// change notification are one atomic step.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    slots: DashMap<SlotKey, Arc<watch::Sender<Option<SlotDocument>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, key: &SlotKey) -> Arc<watch::Sender<Option<SlotDocument>>> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(watch::channel(None).0))
            .clone()
    }
}

#[async_trait]
impl DurableBackend for MemoryBackend {
    async fn get(&self, key: &SlotKey) -> Result<Option<SlotDocument>, StoreError> {
        Ok(self
            .slots
            .get(key)
            .and_then(|sender| sender.borrow().clone()))
    }

    async fn conditional_put(
        &self,
        key: &SlotKey,
        mut document: SlotDocument,
        expected_revision: u64,
    ) -> Result<PutOutcome, StoreError> {
        let sender = self.channel(key);
        let mut outcome = PutOutcome::Conflict {
            current_revision: 0,
        };

        sender.send_if_modified(|current| {
            let current_revision = current.as_ref().map_or(0, |d| d.revision);
            if current_revision != expected_revision {
                outcome = PutOutcome::Conflict { current_revision };
                return false;
            }

            document.revision = expected_revision + 1;
            outcome = PutOutcome::Saved(document.revision);
            *current = Some(document);
            true
        });

        trace!(slot = %key, expected_revision, outcome = ?outcome, "Memory backend put");
        Ok(outcome)
    }

    fn watch_changes(&self, key: &SlotKey) -> DocumentStream {
        WatchStream::new(self.channel(key).subscribe())
            .filter_map(future::ready)
            .boxed()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certmesh_common::WriterId;
    use chrono::Utc;

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
        let backend = MemoryBackend::new();
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
        assert_eq!(
            backend.conditional_put(&key, document(), 1).await.unwrap(),
            PutOutcome::Saved(2)
        );
        assert_eq!(backend.get(&key).await.unwrap().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_racing_puts_have_one_winner() {
        let backend = Arc::new(MemoryBackend::new());
        let key = SlotKey::default();

        let mut handles = Vec::new();
        for _ in 0..8 {
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
}
