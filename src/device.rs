//! The device abstraction collaborator seam.
//!
//! Command queues, buffer allocation, and kernel dispatch are implemented by whatever
//! collaborator the embedding application supplies (an OpenCL, CUDA, or mock queue); this
//! crate only consumes the trait below. Buffers are addressed by an opaque
//! [`BufferHandle`] rather than an associated type so `dyn DeviceCtx` is usable directly
//! by the `Cache` and `Worker`.

use crate::error::Result;

/// Opaque handle to a device-memory buffer, scoped to the `DeviceCtx` that allocated it.
pub type BufferHandle = u64;

/// Global-and-local work-group size for a kernel dispatch, one entry per dimension.
pub type WorkSize = [usize; 3];

/// One bound kernel argument, in the order a `Version`'s `arg_layout` declares.
#[derive(Debug, Clone)]
pub enum KernelArg {
    /// A device buffer (or `None` for a `Hold0` input, passed as a null argument).
    Buffer(Option<BufferHandle>),
    /// An inline scalar value, little-endian encoded.
    Scalar(Vec<u8>),
    /// A 32-bit integer, used for block-size/coord/group-size arguments.
    Int(i32),
}

/// The device-queue collaborator contract.
///
/// Every operation is per-queue; the `Runtime` maps a worker's thread identity
/// `(node, device, rank)` to exactly one queue, so implementations need not be
/// internally synchronized across distinct `DeviceCtx` instances (they may still need to
/// be synchronized against concurrent calls on the *same* instance from the same rank's
/// worker, which never reentrantly calls back into itself).
pub trait DeviceCtx: Send + Sync {
    /// Allocates a zeroed device buffer of `size` bytes.
    fn alloc_buffer(&self, size: usize) -> Result<BufferHandle>;

    /// Frees a previously allocated buffer. Idempotent on an already-freed handle.
    fn free_buffer(&self, handle: BufferHandle) -> Result<()>;

    /// Submits a compiled kernel with its bound arguments and work-group sizes.
    fn enqueue_kernel(&self, source: &str, args: &[KernelArg], gws: WorkSize, lws: WorkSize) -> Result<()>;

    /// Reads `data.len()` bytes from `buffer` starting at `offset` into `data`.
    fn enqueue_read(&self, buffer: BufferHandle, offset: usize, data: &mut [u8]) -> Result<()>;

    /// Writes `data` into `buffer` starting at `offset`.
    fn enqueue_write(&self, buffer: BufferHandle, offset: usize, data: &[u8]) -> Result<()>;

    /// Fills `len` bytes of `buffer` starting at `offset` with a repeating `pattern`.
    fn enqueue_fill(&self, buffer: BufferHandle, offset: usize, len: usize, pattern: &[u8]) -> Result<()>;

    /// Blocks until every previously enqueued operation on this queue has completed
    /// (`clFinish` or equivalent). The only device-side suspension point a worker hits.
    fn finish(&self) -> Result<()>;
}
