//! Shared test doubles for the integration suite.
//!
//! These mirror the in-crate `#[cfg(test)]` doubles (see `cache.rs`, `worker.rs`,
//! `runtime.rs`) but live here because `tests/` only sees `blockjit`'s public surface.
//! `TempFileStore` additionally backs spill with a real `tempfile::TempDir` rather than
//! an in-memory map, so the eviction/spill scenario exercises actual file I/O.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use blockjit::codegen::CodeGen;
use blockjit::device::{BufferHandle, DeviceCtx, KernelArg, WorkSize};
use blockjit::error::Result;
use blockjit::filestore::{FileHandle, FileStore};
use blockjit::ir::Key;
use blockjit::program::Version;
use parking_lot::Mutex;

/// An in-memory device that counts kernel dispatches and leaves buffer contents in
/// place after `free_buffer`, so a test can inspect them once `evaluate` returns.
pub struct CountingDevice {
    next: AtomicU64,
    bufs: Mutex<HashMap<BufferHandle, Vec<u8>>>,
    pub dispatches: AtomicU64,
}

impl CountingDevice {
    pub fn new() -> Self {
        CountingDevice { next: AtomicU64::new(1), bufs: Mutex::new(HashMap::new()), dispatches: AtomicU64::new(0) }
    }

    pub fn snapshot(&self, handle: BufferHandle) -> Vec<u8> {
        self.bufs.lock().get(&handle).cloned().unwrap_or_default()
    }
}

impl DeviceCtx for CountingDevice {
    fn alloc_buffer(&self, size: usize) -> Result<BufferHandle> {
        let h = self.next.fetch_add(1, Ordering::SeqCst);
        self.bufs.lock().insert(h, vec![0u8; size]);
        Ok(h)
    }

    fn free_buffer(&self, _handle: BufferHandle) -> Result<()> {
        // A real device would release the allocation here; this double keeps the bytes
        // around so tests can still read them back after `evaluate` tears the cache down.
        Ok(())
    }

    fn enqueue_kernel(&self, _source: &str, _args: &[KernelArg], _gws: WorkSize, _lws: WorkSize) -> Result<()> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn enqueue_read(&self, buffer: BufferHandle, offset: usize, data: &mut [u8]) -> Result<()> {
        let bufs = self.bufs.lock();
        let b = &bufs[&buffer];
        data.copy_from_slice(&b[offset..offset + data.len()]);
        Ok(())
    }

    fn enqueue_write(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let mut bufs = self.bufs.lock();
        let b = bufs.get_mut(&buffer).unwrap();
        b[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn enqueue_fill(&self, buffer: BufferHandle, offset: usize, len: usize, pattern: &[u8]) -> Result<()> {
        let mut bufs = self.bufs.lock();
        let b = bufs.get_mut(&buffer).unwrap();
        for i in 0..len {
            b[offset + i] = pattern[i % pattern.len()];
        }
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Emits no kernel source; every scenario here exercises orchestration rather than a
/// generated kernel body (real code generation is a collaborator concern, out of scope).
pub struct NullCodeGen;
impl CodeGen for NullCodeGen {
    fn emit(&self, _version: &Version) -> String {
        String::new()
    }
}

/// An in-memory `FileStore` double for scenarios that don't exercise spill.
pub struct NullFileStore;
impl FileStore for NullFileStore {
    fn open(&self, _key: &Key) -> Result<FileHandle> {
        Ok(0)
    }
    fn read_block(&self, _handle: FileHandle, _data: &mut [u8]) -> Result<()> {
        Ok(())
    }
    fn write_block(&self, _handle: FileHandle, _data: &[u8]) -> Result<()> {
        Ok(())
    }
    fn close(&self, _handle: FileHandle) -> Result<()> {
        Ok(())
    }
}

/// A `FileStore` rooted in a real temporary directory, for the cache-eviction scenario's
/// spill round-trip.
pub struct TempFileStore {
    dir: tempfile::TempDir,
    next: AtomicU64,
    paths: Mutex<HashMap<FileHandle, PathBuf>>,
}

impl TempFileStore {
    pub fn new() -> Self {
        TempFileStore { dir: tempfile::tempdir().expect("tempdir"), next: AtomicU64::new(1), paths: Mutex::new(HashMap::new()) }
    }
}

impl FileStore for TempFileStore {
    fn open(&self, key: &Key) -> Result<FileHandle> {
        let handle = self.next.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().insert(handle, self.dir.path().join(key.file_name()));
        Ok(handle)
    }

    fn read_block(&self, handle: FileHandle, data: &mut [u8]) -> Result<()> {
        let path = self.paths.lock().get(&handle).cloned().expect("open before read");
        let bytes = std::fs::read(path)?;
        data.copy_from_slice(&bytes[..data.len()]);
        Ok(())
    }

    fn write_block(&self, handle: FileHandle, data: &[u8]) -> Result<()> {
        let path = self.paths.lock().get(&handle).cloned().expect("open before write");
        std::fs::write(path, data)?;
        Ok(())
    }

    fn close(&self, handle: FileHandle) -> Result<()> {
        if let Some(path) = self.paths.lock().remove(&handle) {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
