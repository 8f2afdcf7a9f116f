//! Memory provider capability interface and the host shared-memory provider.

use std::any::Any;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr::NonNull;

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use super::handle::MemoryLocation;
use crate::errors::{Result, ShardMemError};

/// Backing storage of one mapped region.
///
/// Owns whatever keeps the memory alive (a mapping, a device buffer) and
/// releases it on drop.
pub struct Segment {
    ptr: NonNull<u8>,
    len: usize,
    _owner: Option<Box<dyn Any + Send + Sync>>,
}

// SAFETY: a Segment is a plain address range plus an owner that is itself
// Send + Sync. Concurrent access to the bytes is coordinated by the
// collective protocol (each shard has a single writer, readers synchronize
// through barriers), not by the Segment.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Zero-length segment with a dangling, never-dereferenced pointer
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            _owner: None,
        }
    }

    pub fn from_mmap(mut mmap: MmapMut) -> Self {
        let len = mmap.len();
        if len == 0 {
            return Self::empty();
        }
        let ptr = NonNull::new(mmap.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            _owner: Some(Box::new(mmap)),
        }
    }

    /// Wrap memory owned by another provider.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// `owner` is alive, and must not be freed by anything but dropping `owner`.
    pub unsafe fn from_raw(
        ptr: NonNull<u8>,
        len: usize,
        owner: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            ptr,
            len,
            _owner: Some(owner),
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Allocator a [`crate::Context`] draws local shards from.
pub trait MemoryProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether shards can be placed at `location`
    fn supports(&self, location: MemoryLocation) -> bool;

    /// Whether `create_shared`/`open_shared` work at `location`
    fn supports_shared(&self, location: MemoryLocation) -> bool;

    /// Identity of the node this process runs on. Shared segments are only
    /// visible to processes reporting the same node id.
    fn node_id(&self) -> String;

    /// Shard visible only to this process
    fn allocate_private(&self, location: MemoryLocation, size: usize) -> Result<Segment>;

    /// Create a named shard that peers on the same node can open
    fn create_shared(&self, location: MemoryLocation, name: &str, size: usize) -> Result<Segment>;

    /// Map a named shard created by a peer
    fn open_shared(&self, location: MemoryLocation, name: &str, size: usize) -> Result<Segment>;

    /// Remove the name of a shared shard. Existing mappings stay valid.
    fn unlink_shared(&self, name: &str) -> Result<()>;
}

/// Host memory provider backed by memory maps.
///
/// Private shards are anonymous mappings; shared shards are files under
/// `shm_dir` mapped shared. Serves `Host` only.
pub struct HostMemoryProvider {
    shm_dir: PathBuf,
    node_id: String,
}

impl HostMemoryProvider {
    pub fn new(shm_dir: PathBuf, node_id: String) -> Self {
        Self { shm_dir, node_id }
    }

    fn require_host(&self, location: MemoryLocation) -> Result<()> {
        match location {
            MemoryLocation::Host => Ok(()),
            MemoryLocation::Device => Err(ShardMemError::NotSupported(format!(
                "{} provider cannot place shards in device memory",
                self.name()
            ))),
        }
    }
}

impl MemoryProvider for HostMemoryProvider {
    fn name(&self) -> &str {
        "host"
    }

    fn supports(&self, location: MemoryLocation) -> bool {
        location == MemoryLocation::Host
    }

    fn supports_shared(&self, location: MemoryLocation) -> bool {
        location == MemoryLocation::Host && self.shm_dir.is_dir()
    }

    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    fn allocate_private(&self, location: MemoryLocation, size: usize) -> Result<Segment> {
        self.require_host(location)?;
        if size == 0 {
            return Ok(Segment::empty());
        }

        let mmap = MmapOptions::new().len(size).map_anon().map_err(allocation_error)?;
        debug!(bytes = size, "Mapped private shard");
        Ok(Segment::from_mmap(mmap))
    }

    fn create_shared(&self, location: MemoryLocation, name: &str, size: usize) -> Result<Segment> {
        self.require_host(location)?;
        let path = self.shm_dir.join(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        if let Err(e) = reserve(&file, size) {
            let _ = std::fs::remove_file(&path);
            return Err(allocation_error(e));
        }

        if size == 0 {
            return Ok(Segment::empty());
        }

        // SAFETY: the file was just created exclusively by this process; peers
        // only map it after the creating collective step reports success.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(allocation_error)?;
        debug!(path = %path.display(), bytes = size, "Created shared shard");
        Ok(Segment::from_mmap(mmap))
    }

    fn open_shared(&self, location: MemoryLocation, name: &str, size: usize) -> Result<Segment> {
        self.require_host(location)?;
        let path = self.shm_dir.join(name);

        let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ShardMemError::NotSupported(format!(
                    "shared shard {} is not visible from this process",
                    path.display()
                ))
            } else {
                e.into()
            }
        })?;

        let actual = file.metadata()?.len();
        if actual != size as u64 {
            return Err(ShardMemError::SizeMismatch {
                what: format!("shared shard {}", path.display()),
                expected: size as u64,
                actual,
            });
        }

        if size == 0 {
            return Ok(Segment::empty());
        }

        // SAFETY: the file has the expected length and stays mapped for the
        // lifetime of the returned segment; concurrent access is coordinated
        // by the owning communicator.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(allocation_error)?;
        debug!(path = %path.display(), bytes = size, "Opened shared shard");
        Ok(Segment::from_mmap(mmap))
    }

    fn unlink_shared(&self, name: &str) -> Result<()> {
        std::fs::remove_file(self.shm_dir.join(name))?;
        Ok(())
    }
}

/// Size a fresh shared file with every block allocated, so a segment larger
/// than `shm_dir` can hold fails here instead of faulting on first touch.
fn reserve(file: &File, size: usize) -> std::io::Result<()> {
    if size == 0 {
        return Ok(());
    }

    // SAFETY: the descriptor is owned by `file` and open for writing.
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
    match rc {
        0 => Ok(()),
        libc::EOPNOTSUPP | libc::EINVAL => {
            // Filesystem cannot preallocate; fall back to a sparse length
            debug!(bytes = size, "posix_fallocate unsupported, sizing sparsely");
            file.set_len(size as u64)
        }
        errno => Err(std::io::Error::from_raw_os_error(errno)),
    }
}

/// Out-of-memory, out-of-space and too-large map to resource exhaustion,
/// other failures stay IO errors
fn allocation_error(e: std::io::Error) -> ShardMemError {
    if e.kind() == std::io::ErrorKind::OutOfMemory
        || matches!(
            e.raw_os_error(),
            Some(libc::ENOMEM) | Some(libc::ENOSPC) | Some(libc::EFBIG)
        )
    {
        ShardMemError::ResourceExhausted(e.to_string())
    } else {
        ShardMemError::Io(e)
    }
}
