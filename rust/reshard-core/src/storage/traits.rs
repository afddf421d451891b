// rust/reshard-core/src/storage/traits.rs

//! Storage abstraction traits for checkpoint files.
//!
//! Ranks on different nodes may see different files under the same
//! checkpoint path, so every rank holds its own backend and lists what it can
//! reach.

use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::error::{ReshardError, Result};

/// A handle for reading from storage.
pub trait StorageReader: Read + Seek + Send {
    /// Returns the total size of the object in bytes.
    fn size(&self) -> u64;

    /// Reads `length` bytes starting at byte offset `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the range is out of bounds.
    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>>;
}

/// A handle for writing to storage.
pub trait StorageWriter: Write + Send {
    /// Flushes and syncs the written data. The writer is consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or sync fails.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// The operations the engine needs from a checkpoint store.
///
/// This trait is object-safe and is shared as `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    /// Checks if an object exists at the given path.
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Opens an object for reading.
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Opens an object for writing, truncating it if it exists.
    ///
    /// Parent directories are created if they don't exist.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Creates an object only if nothing exists at `path`.
    ///
    /// Returns `Ok(None)` when the object already exists. Used as a
    /// cross-process lock.
    fn create_new(&self, path: &Path) -> Result<Option<Box<dyn StorageWriter>>>;

    /// Deletes an object.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Lists file names directly under `prefix`, sorted. Hidden files are skipped.
    fn list(&self, prefix: &Path) -> Result<Vec<String>>;

    /// Renames an object from one path to another.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Reads a whole object into memory.
    fn read_all(&self, path: &Path) -> Result<Vec<u8>> {
        let mut reader = self.open_read(path)?;
        let mut data = Vec::with_capacity(reader.size() as usize);
        reader
            .read_to_end(&mut data)
            .map_err(|e| ReshardError::storage_with_source(path, "failed to read object", e))?;
        Ok(data)
    }

    /// Writes a whole object, optionally through a temporary name and a rename.
    fn write_all(&self, path: &Path, data: &[u8], atomic: bool) -> Result<()> {
        let target = if atomic {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            path.with_file_name(format!(".{name}.tmp"))
        } else {
            path.to_path_buf()
        };

        let mut writer = self.open_write(&target)?;
        writer
            .write_all(data)
            .map_err(|e| ReshardError::storage_with_source(&target, "failed to write object", e))?;
        writer.finish()?;

        if atomic {
            self.rename(&target, path)?;
        }
        Ok(())
    }
}
