// rust/reshard-core/src/checkpoint/writer.rs

//! Checkpoint writer implementation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::config::CheckpointConfig;
use crate::error::{ReshardError, Result};
use crate::shard::{LocalTensorIndex, Metadata};
use crate::storage::StorageBackend;
use crate::tensor::Tensor;

use super::format::{checksum, compress, ContainerHeader, PayloadKind, TensorEntry};

/// Writes tensor data files and metadata files.
///
/// Payloads are compressed with the configured algorithm, checksummed, and
/// written through a temporary file and a rename when atomic writes are on.
pub struct CheckpointWriter {
    storage: Arc<dyn StorageBackend>,
    config: CheckpointConfig,
}

impl CheckpointWriter {
    pub fn new(storage: Arc<dyn StorageBackend>, config: CheckpointConfig) -> Self {
        Self { storage, config }
    }

    /// Writes a data file holding `tensors`.
    ///
    /// # Arguments
    ///
    /// * `path` - Path of the data file, relative to the storage base
    /// * `tensors` - Stored pieces keyed by their storage index
    pub fn write_tensors(
        &self,
        path: &Path,
        tensors: &BTreeMap<LocalTensorIndex, Tensor>,
    ) -> Result<()> {
        let total: usize = tensors.values().map(Tensor::nbytes).sum();
        let mut payload = Vec::with_capacity(total);
        let mut entries = Vec::with_capacity(tensors.len());

        for (index, tensor) in tensors {
            entries.push(TensorEntry {
                index: index.clone(),
                dtype: tensor.dtype(),
                shape: tensor.shape().to_vec(),
                offset: payload.len() as u64,
                nbytes: tensor.nbytes() as u64,
                checksum: checksum(tensor.as_bytes()),
            });
            payload.extend_from_slice(tensor.as_bytes());
        }

        debug!(
            path = %path.display(),
            tensors = entries.len(),
            bytes = payload.len(),
            "writing data file"
        );
        self.write_container(path, PayloadKind::Tensors, entries, &payload)
    }

    /// Writes a metadata file.
    pub fn write_metadata(&self, path: &Path, metadata: &Metadata) -> Result<()> {
        let payload = bincode::serialize(metadata).map_err(|e| {
            ReshardError::serialization(format!("failed to encode checkpoint metadata: {e}"))
        })?;
        self.write_container(path, PayloadKind::Metadata, Vec::new(), &payload)
    }

    /// Writes a metadata file while holding an exclusive lock file next to it.
    ///
    /// # Errors
    ///
    /// Returns an error if another writer holds the lock.
    pub fn write_metadata_locked(&self, path: &Path, metadata: &Metadata) -> Result<()> {
        let lock_name = format!(
            "{}.lock",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        let lock_path = path.with_file_name(lock_name);

        let Some(lock) = self.storage.create_new(&lock_path)? else {
            return Err(ReshardError::checkpoint(format!(
                "metadata {} is locked by another writer",
                path.display()
            )));
        };
        lock.finish()?;

        let result = self.write_metadata(path, metadata);
        self.storage.delete(&lock_path)?;
        result
    }

    fn write_container(
        &self,
        path: &Path,
        kind: PayloadKind,
        entries: Vec<TensorEntry>,
        payload: &[u8],
    ) -> Result<()> {
        let compressed = compress(
            payload,
            &self.config.compression,
            self.config.compression_level,
        )?;
        let header = ContainerHeader::new(
            kind,
            self.config.compression.clone(),
            payload.len() as u64,
            checksum(payload),
            entries,
        );

        let header_bytes = bincode::serialize(&header)
            .map_err(|e| ReshardError::checkpoint(format!("failed to serialize header: {e}")))?;

        let header_len = header_bytes.len() as u32;
        let mut data = Vec::with_capacity(4 + header_bytes.len() + compressed.len());
        data.extend_from_slice(&header_len.to_le_bytes());
        data.extend_from_slice(&header_bytes);
        data.extend_from_slice(&compressed);

        self.storage
            .write_all(path, &data, self.config.atomic_writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::LocalStorage;
    use crate::tensor::DType;
    use tempfile::TempDir;

    fn create_test_writer(compression: &str) -> (CheckpointWriter, Arc<dyn StorageBackend>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage_config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(&storage_config).unwrap());
        let config = CheckpointConfig {
            compression: compression.to_string(),
            ..Default::default()
        };
        (
            CheckpointWriter::new(storage.clone(), config),
            storage,
            temp_dir,
        )
    }

    #[test]
    fn test_write_tensors_layout() {
        let (writer, storage, _temp) = create_test_writer("none");
        let mut tensors = BTreeMap::new();
        tensors.insert(
            LocalTensorIndex::new("a", vec![0]),
            Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap(),
        );
        tensors.insert(
            LocalTensorIndex::new("b", vec![0]),
            Tensor::zeros(DType::I64, vec![1]),
        );

        writer
            .write_tensors(Path::new("ckpt/0_0.distcp"), &tensors)
            .unwrap();

        let bytes = storage.read_all(Path::new("ckpt/0_0.distcp")).unwrap();
        let header_len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        let header: ContainerHeader = bincode::deserialize(&bytes[4..4 + header_len]).unwrap();

        assert_eq!(header.kind, PayloadKind::Tensors);
        assert_eq!(header.uncompressed_size, 16);
        assert_eq!(header.entries.len(), 2);
        assert_eq!(header.entries[0].offset, 0);
        assert_eq!(header.entries[1].offset, 8);
        assert_eq!(bytes.len(), 4 + header_len + 16);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let (writer, storage, temp) = create_test_writer("lz4");
        writer
            .write_metadata(Path::new("ckpt/0.metadata"), &Metadata::new())
            .unwrap();

        let entries = storage.list(Path::new("ckpt")).unwrap();
        assert_eq!(entries, vec!["0.metadata"]);
        let on_disk = std::fs::read_dir(temp.path().join("ckpt")).unwrap().count();
        assert_eq!(on_disk, 1);
    }

    #[test]
    fn test_metadata_lock_is_exclusive() {
        let (writer, storage, _temp) = create_test_writer("none");
        let path = Path::new("ckpt/3.metadata");

        storage
            .create_new(Path::new("ckpt/3.metadata.lock"))
            .unwrap()
            .unwrap()
            .finish()
            .unwrap();
        assert!(writer.write_metadata_locked(path, &Metadata::new()).is_err());

        storage.delete(Path::new("ckpt/3.metadata.lock")).unwrap();
        writer.write_metadata_locked(path, &Metadata::new()).unwrap();
        assert!(storage.exists(path).unwrap());
        assert!(!storage.exists(Path::new("ckpt/3.metadata.lock")).unwrap());
    }
}
