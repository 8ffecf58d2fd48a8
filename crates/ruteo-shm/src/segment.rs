//! RAII mapping of one POSIX shared-memory object.

use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use ruteo_core::proto::SegmentKey;

use crate::ShmError;

/// A mapped shared-memory segment.
///
/// Created by the allocating process, attached by everyone else. The
/// mapping is removed on drop; the kernel object itself lives until the
/// allocator (or the registry's cleanup) unlinks it.
pub struct Segment {
    name: String,
    base: NonNull<libc::c_void>,
    len: usize,
}

// The mapping is shared memory by definition; synchronization of its
// contents is the caller's contract (locks in the engine, the cycle
// protocol for buffers).
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a new object of `len` bytes and map it.
    pub fn create(name: &str, len: usize) -> Result<Self, ShmError> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|source| ShmError::Create {
            name: name.to_owned(),
            source,
        })?;
        if let Err(e) = ftruncate(&fd, len as libc::off_t) {
            let _ = shm_unlink(name);
            return Err(ShmError::Os(e));
        }
        match Self::map(name, fd, len) {
            Ok(seg) => Ok(seg),
            Err(e) => {
                let _ = shm_unlink(name);
                Err(e)
            }
        }
    }

    /// Map an object some other process created.
    pub fn attach(name: &str, len: usize) -> Result<Self, ShmError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|source| {
            ShmError::Attach {
                name: name.to_owned(),
                source,
            }
        })?;
        Self::map(name, fd, len)
    }

    /// Attach via a [`SegmentKey`] received over the wire.
    pub fn attach_key(key: &SegmentKey) -> Result<Self, ShmError> {
        let name = ruteo_core::name::from_fixed(&key.name);
        if name.is_empty() {
            return Err(ShmError::BadKey);
        }
        Self::attach(name, key.size as usize)
    }

    fn map(name: &str, fd: OwnedFd, len: usize) -> Result<Self, ShmError> {
        let length = NonZeroUsize::new(len).ok_or(ShmError::BadKey)?;
        // Safety: fresh anonymous-address mapping of a valid fd; the fd
        // may close after mmap, the mapping stays.
        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };
        Ok(Self {
            name: name.to_owned(),
            base,
            len,
        })
    }

    /// The object name this mapping refers to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapping length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for zero-length mappings (never constructed in practice).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr().cast()
    }

    /// Pointer `offset` bytes into the mapping.
    ///
    /// Panics when `offset + size_of::<T>()` overruns the mapping; shared
    /// offsets are engine-computed and a bad one is an invariant
    /// violation, not a recoverable condition.
    pub fn at<T>(&self, offset: usize) -> *mut T {
        assert!(offset + size_of::<T>() <= self.len, "offset outside shm segment");
        // Safety: bounds checked above; alignment is the caller's layout
        // contract (all shared structs are placed at aligned offsets).
        unsafe { self.as_ptr().add(offset).cast() }
    }

    /// The wire key other processes attach with.
    pub fn key(&self) -> SegmentKey {
        SegmentKey {
            name: ruteo_core::name::to_fixed(&self.name),
            size: self.len as u64,
        }
    }

    /// Remove the kernel object by name. Idempotent.
    pub fn unlink(name: &str) -> Result<(), ShmError> {
        match shm_unlink(name) {
            Ok(()) | Err(nix::Error::ENOENT) => Ok(()),
            Err(e) => Err(ShmError::Os(e)),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Safety: base/len came from a successful mmap and are unmapped
        // exactly once.
        unsafe {
            let _ = munmap(self.base, self.len);
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("/ruteo-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn create_attach_share_bytes() {
        let name = unique("seg");
        let a = Segment::create(&name, 4096).unwrap();
        let b = Segment::attach(&name, 4096).unwrap();

        // Safety: disjoint processes in production; here two mappings of
        // the same object in one process, written then read.
        unsafe {
            a.as_ptr().write(0x5A);
            assert_eq!(b.as_ptr().read(), 0x5A);
        }

        drop(a);
        drop(b);
        Segment::unlink(&name).unwrap();
    }

    #[test]
    fn attach_key_roundtrip() {
        let name = unique("key");
        let a = Segment::create(&name, 4096).unwrap();
        let key = a.key();
        assert!(key.is_set());
        let b = Segment::attach_key(&key).unwrap();
        assert_eq!(b.len(), 4096);
        drop(a);
        drop(b);
        Segment::unlink(&name).unwrap();
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = unique("gone");
        Segment::unlink(&name).unwrap();
        Segment::unlink(&name).unwrap();
    }
}
