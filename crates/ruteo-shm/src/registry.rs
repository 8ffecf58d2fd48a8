//! The process-wide registry of ruteo shared-memory segments.
//!
//! One small, well-known POSIX shm object records every segment any ruteo
//! process has allocated, plus which server names are claimed and by which
//! pid. All mutations run under an exclusive `flock` on a lock file next
//! to the object, so a process that dies mid-update never wedges the
//! registry — the next lock holder sees a stale pid and reclaims.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use ruteo_core::name::{from_fixed, to_fixed};
use ruteo_core::proto::SegmentKey;

use crate::{Segment, ShmError};

/// Well-known name of the registry object.
pub const REGISTRY_NAME: &str = "/ruteo-shm-registry";

const REGISTRY_MAGIC: u32 = 0x52_53_48_4D; // "RSHM"
const REGISTRY_PROTOCOL: u32 = 1;
const BACKEND_POSIX: u32 = 1;

const MAX_SERVERS: usize = 64;
const MAX_SEGMENTS: usize = 256;

/// The ABI boundary: any mismatch here invalidates the whole registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct Header {
    magic: u32,
    protocol: u32,
    backend: u32,
    size: u32,
    hdr_len: u32,
    entry_len: u32,
}

/// One claimed server name.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct ServerSlot {
    pid: i32,
    name: [u8; 64],
}

/// One allocated segment.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct SegmentEntry {
    allocator: i32,
    reserved: u32,
    size: u64,
    name: [u8; 32],
}

const HEADER_AT: usize = 0;
const SERVERS_AT: usize = size_of::<Header>();
const ENTRIES_AT: usize = SERVERS_AT + MAX_SERVERS * size_of::<ServerSlot>();
const REGISTRY_BYTES: usize = ENTRIES_AT + MAX_SEGMENTS * size_of::<SegmentEntry>();

fn pid_alive(pid: i32) -> bool {
    // Signal 0 probes existence without delivering anything. EPERM means
    // the process exists but belongs to someone else — still alive.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Handle on the registry, mapped into this process.
pub struct ShmRegistry {
    seg: Segment,
    object_name: String,
    lock_path: PathBuf,
    next_serial: AtomicU32,
}

impl ShmRegistry {
    /// Open (or create) the default registry.
    pub fn open() -> Result<Self, ShmError> {
        Self::open_named(REGISTRY_NAME)
    }

    /// Open (or create) a registry under a non-default name.
    ///
    /// Production uses [`REGISTRY_NAME`]; tests isolate themselves with
    /// unique names.
    pub fn open_named(object_name: &str) -> Result<Self, ShmError> {
        let lock_path = PathBuf::from(format!("/tmp/{}.lock", object_name.trim_start_matches('/')));
        let mut this = Self {
            seg: Self::attach_or_init(object_name, &lock_path)?,
            object_name: object_name.to_owned(),
            lock_path,
            next_serial: AtomicU32::new(1),
        };
        this.revalidate()?;
        Ok(this)
    }

    fn attach_or_init(object_name: &str, lock_path: &PathBuf) -> Result<Segment, ShmError> {
        let _guard = Self::lock_at(lock_path)?;
        match Segment::attach(object_name, REGISTRY_BYTES) {
            Ok(seg) => Ok(seg),
            Err(ShmError::Attach { source: Errno::ENOENT, .. }) => {
                info!(name = object_name, "creating shm registry");
                let seg = Segment::create(object_name, REGISTRY_BYTES)?;
                Self::init(&seg);
                Ok(seg)
            }
            Err(e) => Err(e),
        }
    }

    /// Validate the header under the lock; destroy and re-create once on
    /// mismatch. The registry is metadata only, so this is always safe.
    fn revalidate(&mut self) -> Result<(), ShmError> {
        let _guard = self.lock()?;
        let h: Header = self.read(HEADER_AT);
        let expect = Self::expected_header();
        if h == expect {
            return Ok(());
        }
        warn!(
            magic = h.magic,
            protocol = h.protocol,
            "incompatible shm registry, re-creating"
        );
        Segment::unlink(&self.object_name)?;
        let seg = Segment::create(&self.object_name, REGISTRY_BYTES)?;
        Self::init(&seg);
        self.seg = seg;
        Ok(())
    }

    fn expected_header() -> Header {
        Header {
            magic: REGISTRY_MAGIC,
            protocol: REGISTRY_PROTOCOL,
            backend: BACKEND_POSIX,
            size: REGISTRY_BYTES as u32,
            hdr_len: size_of::<Header>() as u32,
            entry_len: size_of::<SegmentEntry>() as u32,
        }
    }

    fn init(seg: &Segment) {
        // Safety: fresh private mapping, zero then stamp the header.
        unsafe {
            ptr::write_bytes(seg.as_ptr(), 0, seg.len());
        }
        let h = Self::expected_header();
        // Safety: offset 0, in bounds, aligned.
        unsafe { ptr::write(seg.at::<Header>(HEADER_AT), h) };
    }

    fn lock(&self) -> Result<Flock<std::fs::File>, ShmError> {
        Self::lock_at(&self.lock_path)
    }

    fn lock_at(path: &PathBuf) -> Result<Flock<std::fs::File>, ShmError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, e)| ShmError::Os(e))
    }

    // Raw slot access. References into shared memory are never formed;
    // entries are copied in and out whole, under the flock.

    fn read<T: Pod>(&self, offset: usize) -> T {
        // Safety: offsets are compile-time layout constants within the
        // mapping; alignment follows from the layout.
        unsafe { ptr::read(self.seg.at::<T>(offset)) }
    }

    fn write<T: Pod>(&self, offset: usize, value: T) {
        // Safety: as in `read`.
        unsafe { ptr::write(self.seg.at::<T>(offset), value) }
    }

    fn server_at(i: usize) -> usize {
        SERVERS_AT + i * size_of::<ServerSlot>()
    }

    fn entry_at(i: usize) -> usize {
        ENTRIES_AT + i * size_of::<SegmentEntry>()
    }

    /// Claim `server_dir` for this process.
    ///
    /// A live claimant fails the call with [`ShmError::ServerExists`]
    /// unless `replace` is set; dead claimants are reclaimed silently.
    pub fn register_server(&self, server_dir: &str, replace: bool) -> Result<(), ShmError> {
        let my_pid = std::process::id() as i32;
        let _guard = self.lock()?;

        for i in 0..MAX_SERVERS {
            let slot: ServerSlot = self.read(Self::server_at(i));
            if slot.pid == 0 || from_fixed(&slot.name) != server_dir {
                continue;
            }
            if slot.pid == my_pid {
                return Ok(());
            }
            if pid_alive(slot.pid) && !replace {
                return Err(ShmError::ServerExists);
            }
            debug!(pid = slot.pid, dir = server_dir, "reclaiming server slot");
            self.write(Self::server_at(i), ServerSlot::zeroed());
        }

        for i in 0..MAX_SERVERS {
            let slot: ServerSlot = self.read(Self::server_at(i));
            if slot.pid == 0 {
                self.write(
                    Self::server_at(i),
                    ServerSlot {
                        pid: my_pid,
                        name: to_fixed(server_dir),
                    },
                );
                return Ok(());
            }
        }
        Err(ShmError::NoServerSlot)
    }

    /// Release every server slot owned by this process.
    pub fn unregister_server(&self) -> Result<(), ShmError> {
        let my_pid = std::process::id() as i32;
        let _guard = self.lock()?;
        for i in 0..MAX_SERVERS {
            let slot: ServerSlot = self.read(Self::server_at(i));
            if slot.pid == my_pid {
                self.write(Self::server_at(i), ServerSlot::zeroed());
            }
        }
        Ok(())
    }

    /// Allocate a fresh segment of `size` bytes and record it.
    pub fn alloc(&self, size: usize) -> Result<Segment, ShmError> {
        let my_pid = std::process::id() as i32;
        let _guard = self.lock()?;

        let free = (0..MAX_SEGMENTS)
            .find(|&i| self.read::<SegmentEntry>(Self::entry_at(i)).allocator == 0)
            .ok_or(ShmError::NoSegmentEntry)?;

        // O_EXCL retries with a new serial on the unlikely name reuse
        // after a pid wrap.
        let seg = loop {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            let name = format!("/ruteo-{my_pid}-{serial}");
            match Segment::create(&name, size) {
                Ok(seg) => break seg,
                Err(ShmError::Create { source: Errno::EEXIST, .. }) => continue,
                Err(e) => return Err(e),
            }
        };

        self.write(
            Self::entry_at(free),
            SegmentEntry {
                allocator: my_pid,
                reserved: 0,
                size: size as u64,
                name: to_fixed(seg.name()),
            },
        );
        debug!(name = seg.name(), size, "allocated shm segment");
        Ok(seg)
    }

    /// Attach a segment some other process allocated.
    pub fn attach(&self, key: &SegmentKey) -> Result<Segment, ShmError> {
        Segment::attach_key(key)
    }

    /// Unlink a segment this process allocated and clear its entry.
    pub fn destroy(&self, key: &SegmentKey) -> Result<(), ShmError> {
        let my_pid = std::process::id() as i32;
        let name = from_fixed(&key.name);
        let _guard = self.lock()?;
        for i in 0..MAX_SEGMENTS {
            let entry: SegmentEntry = self.read(Self::entry_at(i));
            if entry.allocator == my_pid && from_fixed(&entry.name) == name {
                Segment::unlink(name)?;
                self.write(Self::entry_at(i), SegmentEntry::zeroed());
                return Ok(());
            }
        }
        // Not ours or already gone; destruction is idempotent.
        Ok(())
    }

    /// Destroy every segment whose allocator process no longer exists.
    ///
    /// Live processes release their own segments through
    /// [`ShmRegistry::destroy`]; this sweep is the crash-safety net, run
    /// at server start and stop. Returns how many segments it reclaimed.
    pub fn cleanup(&self) -> Result<usize, ShmError> {
        let _guard = self.lock()?;
        let mut reclaimed = 0;
        for i in 0..MAX_SEGMENTS {
            let entry: SegmentEntry = self.read(Self::entry_at(i));
            if entry.allocator == 0 || pid_alive(entry.allocator) {
                continue;
            }
            let name = from_fixed(&entry.name).to_owned();
            info!(name = %name, allocator = entry.allocator, "reclaiming shm segment");
            Segment::unlink(&name)?;
            self.write(Self::entry_at(i), SegmentEntry::zeroed());
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /// Destroy the registry object itself (tests only in practice).
    pub fn destroy_registry(self) -> Result<(), ShmError> {
        let name = self.object_name.clone();
        drop(self);
        Segment::unlink(&name)
    }
}

impl std::fmt::Debug for ShmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegistry")
            .field("object", &self.object_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        format!("/ruteo-reg-{tag}-{}", std::process::id())
    }

    #[test]
    fn create_then_reopen_validates() {
        let name = unique("open");
        let reg = ShmRegistry::open_named(&name).unwrap();
        drop(reg);
        let reg = ShmRegistry::open_named(&name).unwrap();
        reg.destroy_registry().unwrap();
    }

    #[test]
    fn corrupted_header_forces_recreate() {
        let name = unique("corrupt");
        let reg = ShmRegistry::open_named(&name).unwrap();
        reg.write(
            HEADER_AT,
            Header {
                magic: 0xDEAD_BEEF,
                ..ShmRegistry::expected_header()
            },
        );
        drop(reg);
        // Reopen survives by destroying and re-initializing.
        let reg = ShmRegistry::open_named(&name).unwrap();
        let h: Header = reg.read(HEADER_AT);
        assert_eq!(h, ShmRegistry::expected_header());
        reg.destroy_registry().unwrap();
    }

    #[test]
    fn server_slots_conflict_and_reclaim() {
        let name = unique("servers");
        let reg = ShmRegistry::open_named(&name).unwrap();

        reg.register_server("/tmp/ruteo-0/a", false).unwrap();
        // Same pid re-registers fine.
        reg.register_server("/tmp/ruteo-0/a", false).unwrap();

        // Fake a live foreign claim: pid 1 is always alive.
        reg.write(
            ShmRegistry::server_at(1),
            ServerSlot {
                pid: 1,
                name: to_fixed("/tmp/ruteo-0/b"),
            },
        );
        assert!(matches!(
            reg.register_server("/tmp/ruteo-0/b", false),
            Err(ShmError::ServerExists)
        ));
        reg.register_server("/tmp/ruteo-0/b", true).unwrap();

        // A dead claimant is reclaimed without `replace`.
        reg.write(
            ShmRegistry::server_at(2),
            ServerSlot {
                pid: i32::MAX - 1,
                name: to_fixed("/tmp/ruteo-0/c"),
            },
        );
        reg.register_server("/tmp/ruteo-0/c", false).unwrap();

        reg.unregister_server().unwrap();
        reg.destroy_registry().unwrap();
    }

    #[test]
    fn cleanup_reclaims_dead_allocators_only() {
        let name = unique("alloc");
        let reg = ShmRegistry::open_named(&name).unwrap();

        // Our own live allocation survives the sweep.
        let seg = reg.alloc(4096).unwrap();
        let key = seg.key();
        assert_eq!(reg.cleanup().unwrap(), 0);
        assert!(Segment::attach_key(&key).is_ok());

        // A dead allocator's entry is reclaimed. The object itself is
        // already gone; only the entry needs clearing.
        reg.write(
            ShmRegistry::entry_at(5),
            SegmentEntry {
                allocator: i32::MAX - 1,
                reserved: 0,
                size: 4096,
                name: to_fixed("/ruteo-dead-ghost"),
            },
        );
        assert_eq!(reg.cleanup().unwrap(), 1);
        assert_eq!(reg.cleanup().unwrap(), 0);

        drop(seg);
        reg.destroy(&key).unwrap();
        reg.destroy_registry().unwrap();
    }

    #[test]
    fn destroy_clears_entry() {
        let name = unique("destroy");
        let reg = ShmRegistry::open_named(&name).unwrap();
        let seg = reg.alloc(4096).unwrap();
        let key = seg.key();
        drop(seg);
        reg.destroy(&key).unwrap();
        assert_eq!(reg.cleanup().unwrap(), 0);
        reg.destroy_registry().unwrap();
    }
}
