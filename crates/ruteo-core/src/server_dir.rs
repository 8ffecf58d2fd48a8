//! On-disk layout of a server instance.
//!
//! Each `(user, server-name)` pair owns one directory,
//! `<root>/ruteo-<uid>/<name>/`, created mode 0700. It holds the request
//! socket `ruteo_0`, the handshake ack socket `ruteo_ack_0`, and the
//! wakeup pipes `fifo-<n>` created on demand as the chain grows.

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// Server name used when none is given on the command line.
pub const DEFAULT_SERVER_NAME: &str = "default";

/// Default root under which per-user directories are created.
pub const DEFAULT_TMP_ROOT: &str = "/tmp";

/// Paths of one server instance's on-disk artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDir {
    dir: PathBuf,
}

impl ServerDir {
    /// Locate the directory for `server_name` under the default root.
    pub fn new(server_name: &str) -> Self {
        Self::with_root(Path::new(DEFAULT_TMP_ROOT), server_name)
    }

    /// Locate the directory for `server_name` under an explicit root.
    pub fn with_root(root: &Path, server_name: &str) -> Self {
        // Safety: getuid is always successful and touches no memory.
        let uid = unsafe { libc::getuid() };
        Self {
            dir: root.join(format!("ruteo-{uid}")).join(server_name),
        }
    }

    /// The instance directory itself.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The request/accept socket.
    pub fn request_socket(&self) -> PathBuf {
        self.dir.join("ruteo_0")
    }

    /// The event-ack socket used during the handshake.
    pub fn ack_socket(&self) -> PathBuf {
        self.dir.join("ruteo_ack_0")
    }

    /// Prefix shared by all wakeup FIFOs; `fifo(n)` appends `-<n>`.
    pub fn fifo_prefix(&self) -> PathBuf {
        self.dir.join("fifo")
    }

    /// Path of wakeup FIFO `n`.
    pub fn fifo(&self, n: u32) -> PathBuf {
        fifo_at(&self.fifo_prefix(), n)
    }

    /// Create the directory (and the per-user parent), mode 0700.
    pub fn create(&self) -> io::Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
    }

    /// Remove the directory and everything in it. Idempotent.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Build a FIFO path from a prefix delivered over the wire.
pub fn fifo_at(prefix: &Path, n: u32) -> PathBuf {
    let mut s = prefix.as_os_str().to_os_string();
    s.push(format!("-{n}"));
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_one_directory() {
        let d = ServerDir::with_root(Path::new("/tmp"), "unit");
        assert!(d.request_socket().starts_with(d.dir()));
        assert!(d.ack_socket().starts_with(d.dir()));
        assert_eq!(d.fifo(3).file_name().unwrap(), "fifo-3");
    }

    #[test]
    fn fifo_prefix_matches_fifo_paths() {
        let d = ServerDir::new("unit");
        assert_eq!(fifo_at(&d.fifo_prefix(), 7), d.fifo(7));
    }
}
