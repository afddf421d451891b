// rust/reshard-core/src/checkpoint/reader.rs

//! Checkpoint reader implementation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{ReshardError, Result};
use crate::shard::{LocalTensorIndex, Metadata};
use crate::storage::{StorageBackend, StorageReader};
use crate::tensor::Tensor;

use super::format::{checksum, decompress, ContainerHeader, PayloadKind, TensorEntry};

/// Reads and verifies checkpoint containers.
pub struct CheckpointReader {
    storage: Arc<dyn StorageBackend>,
}

impl CheckpointReader {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Reads a container header without touching the payload.
    pub fn read_header(&self, path: &Path) -> Result<ContainerHeader> {
        let mut reader = self.storage.open_read(path)?;
        let (header, _) = read_header_from(reader.as_mut(), path)?;
        Ok(header)
    }

    /// Reads a metadata file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The header is invalid or not a metadata container
    /// - The checksum doesn't match
    pub fn read_metadata(&self, path: &Path) -> Result<Metadata> {
        let (_, payload) = self.read_payload(path, PayloadKind::Metadata)?;
        bincode::deserialize(&payload).map_err(|e| {
            ReshardError::serialization(format!(
                "failed to decode metadata {}: {e}",
                path.display()
            ))
        })
    }

    /// Reads every tensor stored in a data file.
    pub fn read_tensors(&self, path: &Path) -> Result<BTreeMap<LocalTensorIndex, Tensor>> {
        self.read_tensors_where(path, |_| true)
    }

    /// Reads the tensors of a data file whose index satisfies `wanted`.
    ///
    /// Uncompressed files are read entry by entry when only part of the file
    /// is wanted, each entry checked against its own checksum. Everything
    /// else is read whole and verified against the file checksum.
    pub fn read_tensors_where<F>(
        &self,
        path: &Path,
        wanted: F,
    ) -> Result<BTreeMap<LocalTensorIndex, Tensor>>
    where
        F: Fn(&LocalTensorIndex) -> bool,
    {
        let mut reader = self.storage.open_read(path)?;
        let (header, data_start) = read_header_from(reader.as_mut(), path)?;
        header.validate(PayloadKind::Tensors)?;

        let selected: Vec<&TensorEntry> =
            header.entries.iter().filter(|e| wanted(&e.index)).collect();
        let mut tensors = BTreeMap::new();

        if header.compression == "none" && selected.len() < header.entries.len() {
            for entry in selected {
                let bytes = reader.read_range(data_start + entry.offset, entry.nbytes as usize)?;
                let computed = checksum(&bytes);
                if computed != entry.checksum {
                    return Err(ReshardError::checkpoint(format!(
                        "checksum mismatch for entry {:?} in {}: expected {}, got {}",
                        entry.index,
                        path.display(),
                        entry.checksum,
                        computed
                    )));
                }
                tensors.insert(entry.index.clone(), entry_tensor(entry, bytes, path)?);
            }
            return Ok(tensors);
        }

        let payload = read_verified_payload(reader.as_mut(), &header, path)?;
        for entry in selected {
            let start = entry.offset as usize;
            let end = start + entry.nbytes as usize;
            if end > payload.len() {
                return Err(ReshardError::checkpoint(format!(
                    "entry {:?} in {} exceeds payload of {} bytes",
                    entry.index,
                    path.display(),
                    payload.len()
                )));
            }
            let bytes = payload[start..end].to_vec();
            tensors.insert(entry.index.clone(), entry_tensor(entry, bytes, path)?);
        }
        Ok(tensors)
    }

    fn read_payload(&self, path: &Path, kind: PayloadKind) -> Result<(ContainerHeader, Vec<u8>)> {
        let mut reader = self.storage.open_read(path)?;
        let (header, _) = read_header_from(reader.as_mut(), path)?;
        header.validate(kind)?;
        let payload = read_verified_payload(reader.as_mut(), &header, path)?;
        Ok((header, payload))
    }
}

/// Returns the header and the byte offset where the payload starts.
fn read_header_from(reader: &mut dyn StorageReader, path: &Path) -> Result<(ContainerHeader, u64)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).map_err(|e| {
        ReshardError::checkpoint_with_source(
            format!("failed to read header length of {}", path.display()),
            e,
        )
    })?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    if (4 + header_len) as u64 > reader.size() {
        return Err(ReshardError::checkpoint(format!(
            "checkpoint file {} truncated: header incomplete",
            path.display()
        )));
    }

    let mut header_bytes = vec![0u8; header_len];
    reader.read_exact(&mut header_bytes).map_err(|e| {
        ReshardError::checkpoint_with_source(
            format!("failed to read header of {}", path.display()),
            e,
        )
    })?;

    let header: ContainerHeader = bincode::deserialize(&header_bytes)
        .map_err(|e| ReshardError::checkpoint(format!("failed to deserialize header: {e}")))?;
    Ok((header, 4 + header_len as u64))
}

/// Reads the rest of the stream, decompresses it and checks size and checksum.
fn read_verified_payload(
    reader: &mut dyn StorageReader,
    header: &ContainerHeader,
    path: &Path,
) -> Result<Vec<u8>> {
    let mut compressed = Vec::new();
    reader.read_to_end(&mut compressed).map_err(|e| {
        ReshardError::checkpoint_with_source(
            format!("failed to read payload of {}", path.display()),
            e,
        )
    })?;

    let payload = decompress(&compressed, &header.compression)?;

    let computed = checksum(&payload);
    if computed != header.checksum {
        return Err(ReshardError::checkpoint(format!(
            "checksum mismatch in {}: expected {}, got {}",
            path.display(),
            header.checksum,
            computed
        )));
    }

    if payload.len() as u64 != header.uncompressed_size {
        return Err(ReshardError::checkpoint(format!(
            "size mismatch in {}: expected {}, got {}",
            path.display(),
            header.uncompressed_size,
            payload.len()
        )));
    }

    Ok(payload)
}

fn entry_tensor(entry: &TensorEntry, bytes: Vec<u8>, path: &Path) -> Result<Tensor> {
    Tensor::new(entry.dtype, entry.shape.clone(), bytes).map_err(|e| {
        ReshardError::checkpoint(format!(
            "corrupt entry {:?} in {}: {e}",
            entry.index,
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointWriter;
    use crate::config::{CheckpointConfig, StorageConfig};
    use crate::shard::LocalTensorMetadata;
    use crate::storage::LocalStorage;
    use crate::tensor::DType;
    use std::io::Write as IoWrite;
    use tempfile::TempDir;

    fn create_test_setup(
        compression: &str,
    ) -> (CheckpointWriter, CheckpointReader, Arc<dyn StorageBackend>, TempDir) {
        let temp_dir = TempDir::new().unwrap();

        let storage_config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(&storage_config).unwrap());

        let checkpoint_config = CheckpointConfig {
            compression: compression.to_string(),
            ..Default::default()
        };

        let writer = CheckpointWriter::new(storage.clone(), checkpoint_config);
        let reader = CheckpointReader::new(storage.clone());

        (writer, reader, storage, temp_dir)
    }

    fn sample_tensors() -> BTreeMap<LocalTensorIndex, Tensor> {
        let mut tensors = BTreeMap::new();
        tensors.insert(
            LocalTensorIndex::new("w", vec![0, 0]),
            Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap(),
        );
        tensors.insert(
            LocalTensorIndex::new("w", vec![2, 0]),
            Tensor::from_f32(vec![2, 2], &[5.0, 6.0, 7.0, 8.0]).unwrap(),
        );
        tensors.insert(
            LocalTensorIndex::new("step", vec![]),
            Tensor::new(DType::I64, vec![], 42i64.to_le_bytes().to_vec()).unwrap(),
        );
        tensors
    }

    #[test]
    fn test_tensors_roundtrip_all_compressions() {
        for algo in ["none", "lz4", "zstd"] {
            let (writer, reader, _, _temp) = create_test_setup(algo);
            let tensors = sample_tensors();
            let path = Path::new("ckpt/0_0.distcp");

            writer.write_tensors(path, &tensors).unwrap();
            assert_eq!(reader.read_tensors(path).unwrap(), tensors, "algo {algo}");
        }
    }

    #[test]
    fn test_read_selected_entries() {
        for algo in ["none", "zstd"] {
            let (writer, reader, _, _temp) = create_test_setup(algo);
            let path = Path::new("ckpt/0_0.distcp");
            writer.write_tensors(path, &sample_tensors()).unwrap();

            let loaded = reader
                .read_tensors_where(path, |index| index.tensor_key == "w")
                .unwrap();
            assert_eq!(loaded.len(), 2);
            let second = &loaded[&LocalTensorIndex::new("w", vec![2, 0])];
            assert_eq!(second.to_f32_vec().unwrap(), vec![5.0, 6.0, 7.0, 8.0]);
        }
    }

    #[test]
    fn test_metadata_roundtrip() {
        let (writer, reader, _, _temp) = create_test_setup("lz4");
        let mut metadata = Metadata::new();
        metadata.add_shard(
            "w",
            LocalTensorMetadata {
                global_offset: vec![0, 0],
                local_shape: vec![2, 2],
                dtype: DType::F32,
                global_shape: vec![4, 2],
                flattened_range: None,
            },
            "0_0.distcp",
        );

        let path = Path::new("ckpt/0.metadata");
        writer.write_metadata(path, &metadata).unwrap();
        assert_eq!(reader.read_metadata(path).unwrap(), metadata);

        // A metadata container is not a data file.
        assert!(reader.read_tensors(path).is_err());
    }

    #[test]
    fn test_corruption_detected() {
        let (writer, reader, storage, _temp) = create_test_setup("none");
        let path = Path::new("ckpt/0_0.distcp");
        writer.write_tensors(path, &sample_tensors()).unwrap();

        let mut bytes = storage.read_all(path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut out = storage.open_write(path).unwrap();
        out.write_all(&bytes).unwrap();
        out.finish().unwrap();

        let err = reader.read_tensors(path).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_partial_read_detects_corrupt_entry() {
        let (writer, reader, storage, _temp) = create_test_setup("none");
        let path = Path::new("ckpt/0_0.distcp");
        writer.write_tensors(path, &sample_tensors()).unwrap();

        // The last payload bytes belong to w at [2, 0].
        let mut bytes = storage.read_all(path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut out = storage.open_write(path).unwrap();
        out.write_all(&bytes).unwrap();
        out.finish().unwrap();

        let step = reader
            .read_tensors_where(path, |index| index.tensor_key == "step")
            .unwrap();
        assert_eq!(step.len(), 1);

        let err = reader
            .read_tensors_where(path, |index| index.tensor_key == "w")
            .unwrap_err();
        assert!(err.to_string().contains("checksum mismatch for entry"));
    }

    #[test]
    fn test_truncated_header() {
        let (_, reader, storage, _temp) = create_test_setup("none");
        let path = Path::new("ckpt/bad.distcp");
        let mut out = storage.open_write(path).unwrap();
        out.write_all(&100u32.to_le_bytes()).unwrap();
        out.write_all(b"short").unwrap();
        out.finish().unwrap();

        assert!(reader.read_header(path).is_err());
    }
}
