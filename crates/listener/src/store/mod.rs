//! Tiered certificate storage.
//!
//! Three tiers hold the serving certificate slot:
//!
//! ```text
//!  read:  memory ──miss──> file ──miss──> durable
//!           ^               ^               │
//!           └───────────────┴──write-through┘
//!  write: durable (compare-and-swap) ──ok──> file, memory
//! ```
//!
//! The durable tier is the source of truth. Memory and file are caches:
//! losing them is always safe, and a cache tier that fails to read is
//! treated as a miss for that tier only.

mod directory;
mod file;
mod memory;

pub use directory::DirectoryBackend;
pub use file::FileTier;
pub use memory::{MemoryBackend, MemoryTier};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use certmesh_common::{SlotKey, WriterId};

use crate::errors::StoreError;
use crate::record::{CertificateRecord, SlotDocument, StorageSlot};

/// Delay before re-establishing an ended durable subscription
const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Stream of raw slot documents from a durable backend
pub type DocumentStream = BoxStream<'static, SlotDocument>;

/// Stream of decoded slots
pub type SlotStream = BoxStream<'static, StorageSlot>;

/// Storage tier, fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Memory,
    File,
    Durable,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Memory => write!(f, "memory"),
            Tier::File => write!(f, "file"),
            Tier::Durable => write!(f, "durable"),
        }
    }
}

/// Result of a durable compare-and-swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Saved(u64),
    Conflict { current_revision: u64 },
}

/// Cluster-shared source of truth for storage slots.
///
/// `conditional_put` must be atomic across every process sharing the
/// backend: it stores `document` at `expected_revision + 1` only if the
/// slot is currently at `expected_revision` (0 meaning absent).
#[async_trait]
pub trait DurableBackend: Send + Sync + 'static {
    async fn get(&self, key: &SlotKey) -> Result<Option<SlotDocument>, StoreError>;

    async fn conditional_put(
        &self,
        key: &SlotKey,
        document: SlotDocument,
        expected_revision: u64,
    ) -> Result<PutOutcome, StoreError>;

    /// Change notifications for `key`.
    ///
    /// May deliver duplicates or end at any time; the store filters and
    /// resubscribes.
    fn watch_changes(&self, key: &SlotKey) -> DocumentStream;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// A slot and the tier it was found in
#[derive(Debug, Clone)]
pub struct LoadedSlot {
    pub slot: StorageSlot,
    pub tier: Tier,
}

#[derive(Debug, Clone)]
pub enum SaveOutcome {
    Saved(StorageSlot),
    /// Another writer got there first; caches for the slot were evicted
    Conflict { current_revision: u64 },
}

/// Read-through / write-through store over memory, file and durable tiers
#[derive(Clone)]
pub struct TieredCertStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    memory: MemoryTier,
    file: Option<FileTier>,
    durable: Arc<dyn DurableBackend>,
    writer: WriterId,
    resubscribe_delay: Duration,
}

/// Builder for [`TieredCertStore`]
pub struct TieredStoreBuilder {
    durable: Arc<dyn DurableBackend>,
    file: Option<FileTier>,
    writer: WriterId,
    resubscribe_delay: Duration,
}

impl TieredStoreBuilder {
    pub fn file_cache(mut self, file: FileTier) -> Self {
        self.file = Some(file);
        self
    }

    pub fn writer(mut self, writer: WriterId) -> Self {
        self.writer = writer;
        self
    }

    pub fn resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    pub fn build(self) -> TieredCertStore {
        info!(
            durable = self.durable.name(),
            file_cache = ?self.file.as_ref().map(|f| f.dir().to_path_buf()),
            writer = %self.writer,
            "Initialized tiered certificate store"
        );

        TieredCertStore {
            inner: Arc::new(StoreInner {
                memory: MemoryTier::new(),
                file: self.file,
                durable: self.durable,
                writer: self.writer,
                resubscribe_delay: self.resubscribe_delay,
            }),
        }
    }
}

impl TieredCertStore {
    pub fn builder(durable: Arc<dyn DurableBackend>) -> TieredStoreBuilder {
        TieredStoreBuilder {
            durable,
            file: None,
            writer: WriterId::new(),
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }

    /// Memory and durable tiers only
    pub fn new(durable: Arc<dyn DurableBackend>) -> Self {
        Self::builder(durable).build()
    }

    pub fn writer(&self) -> &WriterId {
        &self.inner.writer
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.inner.memory
    }

    /// Load from the fastest tier holding the slot.
    ///
    /// A durable hit is written through to the file and memory tiers.
    pub async fn load(&self, key: &SlotKey) -> Result<Option<LoadedSlot>, StoreError> {
        if let Some(slot) = self.inner.memory.get(key) {
            trace!(slot = %key, revision = slot.revision, "Memory tier hit");
            return Ok(Some(LoadedSlot {
                slot,
                tier: Tier::Memory,
            }));
        }

        if let Some(file) = &self.inner.file {
            match file.get(key).await {
                Ok(Some(slot)) => {
                    trace!(slot = %key, revision = slot.revision, "File tier hit");
                    self.inner.memory.put_if_newer(key, slot.clone());
                    return Ok(Some(LoadedSlot {
                        slot,
                        tier: Tier::File,
                    }));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(slot = %key, error = %e, "File tier unreadable, treating as miss");
                }
            }
        }

        Ok(self.load_durable(key).await?.map(|slot| LoadedSlot {
            slot,
            tier: Tier::Durable,
        }))
    }

    /// Load straight from the durable tier, refreshing the caches on a hit.
    ///
    /// Used whenever a cached record is suspect: durable always wins.
    pub async fn load_durable(&self, key: &SlotKey) -> Result<Option<StorageSlot>, StoreError> {
        let Some(document) = self.inner.durable.get(key).await? else {
            trace!(slot = %key, "Durable tier miss");
            return Ok(None);
        };

        let revision = document.revision;
        let slot = StorageSlot::from_document(document).map_err(|e| StoreError::CorruptSlot {
            key: key.to_string(),
            revision,
            reason: e.to_string(),
        })?;

        trace!(slot = %key, revision, "Durable tier hit");
        self.write_through(key, &slot).await;
        Ok(Some(slot))
    }

    /// Compare-and-swap `record` into the durable tier.
    ///
    /// On success the caches are updated unconditionally; on conflict they
    /// are evicted so the next [`load`](Self::load) observes the winner.
    pub async fn save(
        &self,
        key: &SlotKey,
        record: Arc<CertificateRecord>,
        expected_revision: u64,
    ) -> Result<SaveOutcome, StoreError> {
        let slot = StorageSlot {
            revision: expected_revision + 1,
            record,
            written_by: self.inner.writer.clone(),
            updated_at: Utc::now(),
        };

        match self
            .inner
            .durable
            .conditional_put(key, slot.to_document(), expected_revision)
            .await?
        {
            PutOutcome::Saved(revision) => {
                let slot = StorageSlot { revision, ..slot };
                self.inner.memory.put(key, slot.clone());
                if let Some(file) = &self.inner.file {
                    if let Err(e) = file.put(key, &slot).await {
                        warn!(slot = %key, error = %e, "Failed to update file tier");
                    }
                }

                info!(
                    slot = %key,
                    revision,
                    fingerprint = %slot.record.fingerprint(),
                    "Saved certificate to durable tier"
                );
                Ok(SaveOutcome::Saved(slot))
            }
            PutOutcome::Conflict { current_revision } => {
                debug!(
                    slot = %key,
                    expected_revision,
                    current_revision,
                    "Durable write lost the race, evicting caches"
                );
                self.evict(key).await;
                Ok(SaveOutcome::Conflict { current_revision })
            }
        }
    }

    /// Restartable, infinite stream of revision increases for `key`.
    ///
    /// Each revision is delivered once per stream, including writes made by
    /// this store. Newer revisions are written through to the caches before
    /// they are yielded. Dropping the stream cancels it.
    pub fn watch(&self, key: &SlotKey) -> SlotStream {
        let state = WatchState {
            store: self.clone(),
            key: key.clone(),
            inner: None,
            last_revision: 0,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                let next = match state.inner.as_mut() {
                    Some(inner) => inner.next().await,
                    None => {
                        debug!(slot = %state.key, "Subscribing to durable changes");
                        state.inner = Some(state.store.inner.durable.watch_changes(&state.key));
                        continue;
                    }
                };

                let Some(document) = next else {
                    warn!(
                        slot = %state.key,
                        delay_ms = state.store.inner.resubscribe_delay.as_millis() as u64,
                        "Durable change subscription ended, resubscribing"
                    );
                    state.inner = None;
                    tokio::time::sleep(state.store.inner.resubscribe_delay).await;
                    continue;
                };

                if document.revision <= state.last_revision {
                    continue;
                }

                let revision = document.revision;
                state.last_revision = revision;

                match StorageSlot::from_document(document) {
                    Ok(slot) => {
                        state.store.write_through(&state.key, &slot).await;
                        return Some((slot, state));
                    }
                    Err(e) => {
                        warn!(
                            slot = %state.key,
                            revision,
                            error = %e,
                            "Ignoring corrupt durable revision"
                        );
                    }
                }
            }
        })
        .boxed()
    }

    async fn write_through(&self, key: &SlotKey, slot: &StorageSlot) {
        if !self.inner.memory.put_if_newer(key, slot.clone()) {
            return;
        }

        if let Some(file) = &self.inner.file {
            if let Err(e) = file.put(key, slot).await {
                warn!(slot = %key, error = %e, "Failed to write through to file tier");
            }
        }
    }

    async fn evict(&self, key: &SlotKey) {
        self.inner.memory.evict(key);
        if let Some(file) = &self.inner.file {
            if let Err(e) = file.evict(key).await {
                warn!(slot = %key, error = %e, "Failed to evict file tier");
            }
        }
    }
}

impl fmt::Debug for TieredCertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredCertStore")
            .field("durable", &self.inner.durable.name())
            .field("file", &self.inner.file)
            .field("writer", &self.inner.writer)
            .finish()
    }
}

struct WatchState {
    store: TieredCertStore,
    key: SlotKey,
    inner: Option<DocumentStream>,
    last_revision: u64,
}

/// Revision of a slot document whose payload may not fully parse
#[derive(Deserialize)]
struct RevisionOnly {
    revision: u64,
}

/// Best-effort revision of undecodable slot bytes; 0 when unknown
pub(crate) fn salvage_revision(bytes: &[u8]) -> u64 {
    serde_json::from_slice::<RevisionOnly>(bytes)
        .map(|r| r.revision)
        .unwrap_or(0)
}
