//! Fixed-size file chunking

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::PipelineError;
use crate::model::ContentHash;

/// 500 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 500 * 1024;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    pub data: Vec<u8>,
    pub hash: ContentHash,
}

/// Lazy, single-pass chunk sequence over one file. Every chunk is full size
/// except possibly the last; an empty file yields nothing.
pub struct FileChunker {
    reader: File,
    chunk_size: usize,
    next_index: usize,
    file_hasher: Sha256,
    size: u64,
    done: bool,
}

impl FileChunker {
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self, PipelineError> {
        if chunk_size == 0 {
            return Err(PipelineError::InvalidChunkSize);
        }
        Ok(Self {
            reader: File::open(path)?,
            chunk_size,
            next_index: 0,
            file_hasher: Sha256::new(),
            size: 0,
            done: false,
        })
    }

    /// Whole-file hash and size. Only meaningful once the iterator is exhausted.
    pub fn finish(self) -> (ContentHash, u64) {
        (
            ContentHash::from_bytes(self.file_hasher.finalize().into()),
            self.size,
        )
    }

    fn fill(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl Iterator for FileChunker {
    type Item = Result<Chunk, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let data = match self.fill() {
            Ok(data) => data,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };
        if data.len() < self.chunk_size {
            self.done = true;
        }
        if data.is_empty() {
            return None;
        }

        self.file_hasher.update(&data);
        self.size += data.len() as u64;
        let index = self.next_index;
        self.next_index += 1;
        let hash = ContentHash::of(&data);
        Some(Ok(Chunk { index, data, hash }))
    }
}
