//! The swap manager: the spill path for blobs no tier can absorb.
//!
//! Each node owns one append-only swap file. Spilling a blob appends its
//! bytes and yields a [`SwapBlob`] record; the record packs into a
//! 4-entry buffer-id list and is bound to a `BlobId` whose node field is
//! negated, which is how the rest of the system recognizes swapped blobs.
//! Reclamation of swap space is intentionally not defined yet.

use bytes::Bytes;
use hermes_common::{BucketId, Result, SwapBlob, SwapConfig};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use tracing::info;

/// Append-only spill store for one node.
pub struct SwapManager {
    node_id: u32,
    path: PathBuf,
    /// Guards the append offset; reads go through positional I/O and take
    /// no lock.
    file: Mutex<File>,
}

impl SwapManager {
    /// Open (creating if needed) this node's swap file.
    pub fn open(config: &SwapConfig, node_id: u32) -> Result<Self> {
        let path = config.swap_file_path(node_id);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        info!(node_id, path = %path.display(), "opened swap file");
        Ok(Self {
            node_id,
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the swap file.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append a blob's bytes, returning the record that locates them.
    pub fn append(&self, data: &[u8], bucket_id: BucketId) -> Result<SwapBlob> {
        let file = self.file.lock();
        let offset = file.metadata()?.len();
        file.write_all_at(data, offset)?;
        Ok(SwapBlob {
            node_id: self.node_id,
            offset,
            size: data.len() as u64,
            bucket_id,
        })
    }

    /// Read a spilled blob back.
    pub fn read(&self, swap_blob: &SwapBlob) -> Result<Bytes> {
        let mut out = vec![0u8; swap_blob.size as usize];
        self.file.lock().read_exact_at(&mut out, swap_blob.offset)?;
        Ok(Bytes::from(out))
    }
}

/// Read a spilled blob recorded by any node. Swap files live on storage
/// every node can reach; the record's node id selects the file.
pub fn read_swap_blob(config: &SwapConfig, swap_blob: &SwapBlob) -> Result<Bytes> {
    let file = OpenOptions::new()
        .read(true)
        .open(config.swap_file_path(swap_blob.node_id))?;
    let mut out = vec![0u8; swap_blob.size as usize];
    file.read_exact_at(&mut out, swap_blob.offset)?;
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_common::BufferId;

    fn swap_config(dir: &tempfile::TempDir) -> SwapConfig {
        SwapConfig {
            mount_point: dir.path().to_string_lossy().into_owned(),
            ..SwapConfig::default()
        }
    }

    #[test]
    fn test_append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let swap = SwapManager::open(&swap_config(&dir), 1).unwrap();

        let bucket = BucketId::new(1, 3);
        let first = swap.append(b"first blob", bucket).unwrap();
        let second = swap.append(b"second", bucket).unwrap();

        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, first.size);
        assert_eq!(&swap.read(&first).unwrap()[..], b"first blob");
        assert_eq!(&swap.read(&second).unwrap()[..], b"second");
    }

    #[test]
    fn test_record_roundtrips_through_id_list() {
        let dir = tempfile::tempdir().unwrap();
        let swap = SwapManager::open(&swap_config(&dir), 2).unwrap();

        let record = swap.append(&[7u8; 100], BucketId::new(2, 1)).unwrap();
        let ids: Vec<BufferId> = record.to_buffer_ids();
        let back = SwapBlob::from_buffer_ids(&ids).unwrap();
        assert_eq!(back, record);
        assert_eq!(&swap.read(&back).unwrap()[..], &[7u8; 100][..]);
    }

    #[test]
    fn test_file_named_by_node() {
        let dir = tempfile::tempdir().unwrap();
        let swap = SwapManager::open(&swap_config(&dir), 7).unwrap();
        assert!(swap
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains('7'));
    }
}
