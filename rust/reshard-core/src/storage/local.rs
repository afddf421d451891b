// rust/reshard-core/src/storage/local.rs

//! Local filesystem storage backend.
//!
//! Small checkpoint files are read through a buffered reader; files above
//! the configured threshold are memory-mapped.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::traits::{StorageBackend, StorageReader, StorageWriter};
use crate::config::StorageConfig;
use crate::error::{ReshardError, Result};

/// Local filesystem storage backend.
pub struct LocalStorage {
    /// Base path for relative paths.
    base_path: PathBuf,
    /// Buffer size for buffered I/O operations.
    buffer_size: usize,
    /// Whether to use memory-mapped I/O.
    use_mmap: bool,
    /// File size threshold above which to use mmap.
    mmap_threshold: u64,
}

impl LocalStorage {
    /// Creates a new `LocalStorage` instance from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let base_path = config.base_path.clone();

        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                ReshardError::storage_with_source(&base_path, "failed to create base directory", e)
            })?;
        }

        Ok(Self {
            base_path,
            buffer_size: config.buffer_size,
            use_mmap: config.use_mmap,
            mmap_threshold: config.mmap_threshold,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    ReshardError::storage_with_source(
                        parent,
                        "failed to create parent directories",
                        e,
                    )
                })?;
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.resolve_path(path).exists())
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path)
            .map_err(|e| ReshardError::storage_with_source(&full_path, "failed to open file", e))?;

        let size = file
            .metadata()
            .map_err(|e| {
                ReshardError::storage_with_source(&full_path, "failed to read file metadata", e)
            })?
            .len();

        if self.use_mmap && size >= self.mmap_threshold {
            // SAFETY: the file is opened read-only and the map lives as long
            // as the reader. Checkpoint files are not modified once written.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                ReshardError::storage_with_source(&full_path, "failed to memory-map file", e)
            })?;
            Ok(Box::new(MmapReader {
                mmap,
                pos: 0,
                path: full_path,
            }))
        } else {
            Ok(Box::new(LocalReader {
                reader: BufReader::with_capacity(self.buffer_size, file),
                size,
                path: full_path,
            }))
        }
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .map_err(|e| {
                ReshardError::storage_with_source(&full_path, "failed to create file", e)
            })?;

        Ok(Box::new(LocalWriter {
            writer: BufWriter::with_capacity(self.buffer_size, file),
            path: full_path,
        }))
    }

    fn create_new(&self, path: &Path) -> Result<Option<Box<dyn StorageWriter>>> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path)?;

        match OpenOptions::new().write(true).create_new(true).open(&full_path) {
            Ok(file) => Ok(Some(Box::new(LocalWriter {
                writer: BufWriter::with_capacity(self.buffer_size, file),
                path: full_path,
            }))),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(ReshardError::storage_with_source(
                &full_path,
                "failed to create file exclusively",
                e,
            )),
        }
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);

        if full_path.is_dir() {
            fs::remove_dir_all(&full_path).map_err(|e| {
                ReshardError::storage_with_source(&full_path, "failed to delete directory", e)
            })
        } else {
            fs::remove_file(&full_path).map_err(|e| {
                ReshardError::storage_with_source(&full_path, "failed to delete file", e)
            })
        }
    }

    fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        let full_path = self.resolve_path(prefix);

        if !full_path.exists() {
            return Ok(Vec::new());
        }

        if !full_path.is_dir() {
            return Err(ReshardError::storage(&full_path, "path is not a directory"));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&full_path).map_err(|e| {
            ReshardError::storage_with_source(&full_path, "failed to read directory", e)
        })? {
            let entry = entry.map_err(|e| {
                ReshardError::storage_with_source(&full_path, "failed to read directory entry", e)
            })?;

            let is_file = entry.file_type().is_ok_and(|t| t.is_file());
            match entry.file_name().to_str() {
                // In-flight atomic writes are hidden until renamed.
                Some(name) if is_file && !name.starts_with('.') => entries.push(name.to_string()),
                _ => {}
            }
        }

        entries.sort();
        Ok(entries)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        Self::ensure_parent(&to_path)?;

        fs::rename(&from_path, &to_path).map_err(|e| {
            ReshardError::storage_with_source(
                &from_path,
                format!("failed to rename to {}", to_path.display()),
                e,
            )
        })
    }
}

/// Buffered file reader.
struct LocalReader {
    reader: BufReader<File>,
    size: u64,
    path: PathBuf,
}

impl Read for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for LocalReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageReader for LocalReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(start)).map_err(|e| {
            ReshardError::storage_with_source(
                &self.path,
                format!("failed to seek to position {start}"),
                e,
            )
        })?;

        let mut buf = vec![0u8; length];
        self.read_exact(&mut buf).map_err(|e| {
            ReshardError::storage_with_source(
                &self.path,
                format!("failed to read {length} bytes at position {start}"),
                e,
            )
        })?;

        Ok(buf)
    }
}

/// Memory-mapped file reader.
struct MmapReader {
    mmap: Mmap,
    pos: u64,
    path: PathBuf,
}

impl Read for MmapReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let pos = (self.pos as usize).min(self.mmap.len());
        let remaining = &self.mmap[pos..];
        let to_read = buf.len().min(remaining.len());

        buf[..to_read].copy_from_slice(&remaining[..to_read]);
        self.pos += to_read as u64;
        Ok(to_read)
    }
}

impl Seek for MmapReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.mmap.len() as i64 + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };

        if new_pos < 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }

        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

impl StorageReader for MmapReader {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        let start = start as usize;
        let end = start + length;

        if end > self.mmap.len() {
            return Err(ReshardError::storage(
                &self.path,
                format!(
                    "read range {start}..{end} exceeds file size {}",
                    self.mmap.len()
                ),
            ));
        }

        Ok(self.mmap[start..end].to_vec())
    }
}

/// Buffered file writer.
struct LocalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageWriter for LocalWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().map_err(|e| {
            ReshardError::storage_with_source(&self.path, "failed to flush writer", e)
        })?;

        self.writer.get_ref().sync_all().map_err(|e| {
            ReshardError::storage_with_source(&self.path, "failed to sync file to disk", e)
        })?;

        Ok(())
    }
}
