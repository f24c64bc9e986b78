//! The file-backed block-persistence collaborator seam.
//!
//! The `Cache` spills dirty dense blocks to disk under eviction pressure and reloads them
//! on a later `requestBlocks` hit. This crate only consumes the trait below; the
//! embedding application supplies a real filesystem- or object-store-backed
//! implementation.

use crate::error::Result;
use crate::ir::Key;

/// Opaque per-key file handle, scoped to the `FileStore` that opened it.
pub type FileHandle = u64;

/// The file-persistence collaborator contract. Implementations must be thread-safe per
/// handle: `Cache` may read and write the same open handle from different workers under
/// its own `mtx_file` serialization, but never concurrently without that lock held.
pub trait FileStore: Send + Sync {
    /// Opens (creating if absent) the backing file for `key`, returning a handle.
    fn open(&self, key: &Key) -> Result<FileHandle>;

    /// Reads a whole block's raw element stream from `handle` into `data`.
    fn read_block(&self, handle: FileHandle, data: &mut [u8]) -> Result<()>;

    /// Writes a whole block's raw element stream to `handle`.
    fn write_block(&self, handle: FileHandle, data: &[u8]) -> Result<()>;

    /// Closes `handle`, releasing any OS-level resource. Idempotent.
    fn close(&self, handle: FileHandle) -> Result<()>;
}
