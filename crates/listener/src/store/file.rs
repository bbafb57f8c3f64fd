//! On-disk cache tier.
//!
//! Each slot is one JSON document at `<dir>/<slot>.json`, written atomically
//! (temp file + rename) with mode 0600 since it carries the private key.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::trace;
use uuid::Uuid;

use certmesh_common::SlotKey;

use super::Tier;
use crate::errors::StoreError;
use crate::record::{SlotDocument, StorageSlot};

#[derive(Debug, Clone)]
pub struct FileTier {
    dir: PathBuf,
}

impl FileTier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &SlotKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.file_stem()))
    }

    /// Read the cached slot; unreadable or undecodable files are a
    /// [`StoreError::TierMiss`]
    pub async fn get(&self, key: &SlotKey) -> Result<Option<StorageSlot>, StoreError> {
        let path = self.path_for(key);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!(path = %path.display(), "File tier miss");
                return Ok(None);
            }
            Err(e) => return Err(self.miss(key, e.to_string())),
        };

        let document: SlotDocument =
            serde_json::from_slice(&bytes).map_err(|e| self.miss(key, e.to_string()))?;

        StorageSlot::from_document(document)
            .map(Some)
            .map_err(|e| self.miss(key, e.to_string()))
    }

    pub async fn put(&self, key: &SlotKey, slot: &StorageSlot) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(key);
        let content = serde_json::to_vec_pretty(&slot.to_document())?;
        write_atomic(&path, &content).await?;

        trace!(path = %path.display(), revision = slot.revision, "Wrote file tier");
        Ok(())
    }

    pub async fn evict(&self, key: &SlotKey) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn miss(&self, key: &SlotKey, reason: String) -> StoreError {
        StoreError::TierMiss {
            tier: Tier::File,
            key: key.to_string(),
            reason,
        }
    }
}

/// Write `content` to a sibling temp file and rename it over `path`
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    tokio::fs::write(&tmp, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::factory::CertificateFactory;
    use crate::identity::RequiredIdentity;
    use certmesh_common::WriterId;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn slot() -> StorageSlot {
        let ca = CertificateAuthority::generate_self_signed("File Test CA").unwrap();
        let factory = CertificateFactory::new(Arc::new(ca), Duration::from_secs(86400));
        let identity = RequiredIdentity::new("certmesh", "certmesh", ["localhost"].into_iter().collect());
        StorageSlot {
            revision: 4,
            record: Arc::new(factory.generate_leaf(&identity).unwrap()),
            written_by: WriterId::from_string("node-a"),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_get_evict() {
        let dir = TempDir::new().unwrap();
        let tier = FileTier::new(dir.path().join("tls"));
        let key = SlotKey::default();

        assert!(tier.get(&key).await.unwrap().is_none());

        let slot = slot();
        tier.put(&key, &slot).await.unwrap();
        assert!(tier.path_for(&key).ends_with("tls/certmesh-serving.json"));

        let loaded = tier.get(&key).await.unwrap().unwrap();
        assert_eq!(loaded.revision, 4);
        assert_eq!(loaded.record, slot.record);
        assert_eq!(loaded.written_by, slot.written_by);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(tier.path_for(&key))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        tier.evict(&key).await.unwrap();
        assert!(tier.get(&key).await.unwrap().is_none());
        tier.evict(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_is_tier_miss() {
        let dir = TempDir::new().unwrap();
        let tier = FileTier::new(dir.path());
        let key = SlotKey::default();

        std::fs::write(tier.path_for(&key), b"{ not json").unwrap();

        let err = tier.get(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::TierMiss { tier: Tier::File, .. }));
    }
}
