//! # Chunk Stores
//!
//! Indexed random access over fixed-capacity records. A transfer owns two of
//! these: one for 32-byte clear hashes, one for cipher chunks. They are the
//! unit of persistence for a transfer in flight — after a failed decryption
//! they hold everything needed to build the fraud proof, so they are kept on
//! error and deleted only on clean completion.
//!
//! The file layout is `LE32 length || payload || zero padding` per record,
//! which keeps `get` a single seek even when the final record is short.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors from chunk-store operations. The transfer pipeline surfaces these
/// as transport failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record {0} out of range")]
    OutOfRange(u64),

    #[error("record exceeds capacity: {len} > {capacity}")]
    Oversized { len: usize, capacity: usize },

    #[error("corrupt record {index}: stored length {len} exceeds capacity {capacity}")]
    Corrupt {
        index: u64,
        len: usize,
        capacity: usize,
    },
}

/// Indexed random-access container over fixed-capacity records.
pub trait ChunkStore {
    /// Appends a record, returning its index.
    fn append(&mut self, record: &[u8]) -> Result<u64, StoreError>;

    /// Reads the record at `index`.
    fn get(&self, index: u64) -> Result<Vec<u8>, StoreError>;

    /// Number of records stored.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// File-Backed Store
// ---------------------------------------------------------------------------

/// On-disk chunk store. One file per store, records at fixed offsets.
#[derive(Debug)]
pub struct FileChunkStore {
    file: File,
    path: PathBuf,
    capacity: usize,
    count: u64,
}

impl FileChunkStore {
    /// Creates (or truncates) a store at `path` with the given record
    /// capacity.
    pub fn create(path: impl AsRef<Path>, capacity: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            capacity,
            count: 0,
        })
    }

    /// The on-disk location, for cleanup and error reporting.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn record_size(&self) -> u64 {
        4 + self.capacity as u64
    }

    /// Removes the backing file. Consumes the store; call on clean
    /// completion only — error paths keep the file for proof construction.
    pub fn remove(self) -> Result<(), StoreError> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl ChunkStore for FileChunkStore {
    fn append(&mut self, record: &[u8]) -> Result<u64, StoreError> {
        if record.len() > self.capacity {
            return Err(StoreError::Oversized {
                len: record.len(),
                capacity: self.capacity,
            });
        }
        let index = self.count;
        self.file.seek(SeekFrom::Start(index * self.record_size()))?;
        self.file.write_all(&(record.len() as u32).to_le_bytes())?;
        self.file.write_all(record)?;
        let padding = self.capacity - record.len();
        if padding > 0 {
            self.file.write_all(&vec![0u8; padding])?;
        }
        self.count += 1;
        Ok(index)
    }

    fn get(&self, index: u64) -> Result<Vec<u8>, StoreError> {
        if index >= self.count {
            return Err(StoreError::OutOfRange(index));
        }
        let mut file = &self.file;
        file.seek(SeekFrom::Start(index * self.record_size()))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > self.capacity {
            return Err(StoreError::Corrupt {
                index,
                len,
                capacity: self.capacity,
            });
        }
        let mut record = vec![0u8; len];
        file.read_exact(&mut record)?;
        Ok(record)
    }

    fn len(&self) -> u64 {
        self.count
    }
}

// ---------------------------------------------------------------------------
// In-Memory Store
// ---------------------------------------------------------------------------

/// Heap-backed store with the same semantics. Used by tests and by the
/// seller side, which never persists chunks.
#[derive(Debug, Default)]
pub struct MemChunkStore {
    capacity: usize,
    records: Vec<Vec<u8>>,
}

impl MemChunkStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Vec::new(),
        }
    }
}

impl ChunkStore for MemChunkStore {
    fn append(&mut self, record: &[u8]) -> Result<u64, StoreError> {
        if record.len() > self.capacity {
            return Err(StoreError::Oversized {
                len: record.len(),
                capacity: self.capacity,
            });
        }
        self.records.push(record.to_vec());
        Ok(self.records.len() as u64 - 1)
    }

    fn get(&self, index: u64) -> Result<Vec<u8>, StoreError> {
        self.records
            .get(index as usize)
            .cloned()
            .ok_or(StoreError::OutOfRange(index))
    }

    fn len(&self) -> u64 {
        self.records.len() as u64
    }
}
