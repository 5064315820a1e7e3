//! File-Backed Memory Mapping
//!
//! Cross-platform wrapper around `memmap2`, mapping a *file* rather
//! than an anonymous region: the whole point of the store is that its
//! bytes survive a process restart.

use crate::error::{Result, SlsError};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// A writable mapping of a backing file.
pub struct FileMapping {
    file: File,
    mmap: MmapMut,
}

impl FileMapping {
    /// Open an existing file and map its full length.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SlsError::IoError(format!("opening {}: {e}", path.display())))?;

        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| SlsError::IoError(format!("mmap {}: {e}", path.display())))?
        };

        Ok(Self { file, mmap })
    }

    /// Create (or truncate) a file of exactly `size` bytes, zero-filled,
    /// and map it.
    pub fn create(path: &Path, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| SlsError::IoError(format!("creating {}: {e}", path.display())))?;

        file.set_len(size)
            .map_err(|e| SlsError::IoError(format!("sizing {}: {e}", path.display())))?;

        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| SlsError::IoError(format!("mmap {}: {e}", path.display())))?
        };

        Ok(Self { file, mmap })
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    /// Flush the entire mapping to the backing file.
    pub fn sync(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| SlsError::IoError(format!("flush: {e}")))
    }

    /// Flush the page-aligned range covering `[offset, offset+len)`.
    pub fn sync_range(&self, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let page = crate::config::PAGE_SIZE;
        let aligned_start = (offset / page) * page;
        let aligned_end = crate::config::align_up(offset + len, page);
        let aligned_len = (aligned_end - aligned_start) as usize;
        self.mmap
            .flush_range(aligned_start as usize, aligned_len)
            .map_err(|e| SlsError::IoError(format!("flush_range: {e}")))
    }

    /// Current length of the backing file on disk (may differ from the
    /// mapping length only transiently; the store never resizes a live
    /// mapping).
    pub fn file_len(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| SlsError::IoError(format!("stat: {e}")))
    }
}
