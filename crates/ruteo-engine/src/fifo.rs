//! The wakeup FIFOs that serialize the chain.
//!
//! `fifo-<n>` named pipes live in the server directory and are created on
//! demand as external clients activate. The engine opens each one
//! read-write and keeps it open: writes can then never see EPIPE and
//! client opens never block, no matter what the far end does.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tracing::debug;

use ruteo_core::server_dir::ServerDir;

use crate::error::EngineError;

/// The engine's table of open FIFO fds, indexed by chain rank.
pub struct FifoSet {
    dir: ServerDir,
    fds: Vec<Option<File>>,
}

impl FifoSet {
    /// An empty table rooted at the server directory.
    pub fn new(dir: ServerDir) -> Self {
        Self {
            dir,
            fds: Vec::new(),
        }
    }

    /// Make sure `fifo-<n>` exists and is open; return its fd.
    pub fn ensure(&mut self, n: u32) -> Result<RawFd, EngineError> {
        if self.fds.len() <= n as usize {
            self.fds.resize_with(n as usize + 1, || None);
        }
        if let Some(fd) = &self.fds[n as usize] {
            return Ok(fd.as_raw_fd());
        }

        let path = self.dir.fifo(n);
        match mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(()) => debug!(path = %path.display(), "created wakeup fifo"),
            Err(Errno::EEXIST) => {}
            Err(e) => return Err(EngineError::Fifo(e)),
        }

        // Read-write so our writes never EPIPE when no client holds the
        // read end yet (or any more).
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let raw = file.as_raw_fd();
        self.fds[n as usize] = Some(file);
        Ok(raw)
    }

    /// The fd of `fifo-<n>` if already open.
    pub fn fd(&self, n: u32) -> Option<RawFd> {
        self.fds
            .get(n as usize)
            .and_then(|f| f.as_ref())
            .map(AsRawFd::as_raw_fd)
    }

    /// Drain stale wakeup bytes from every open FIFO.
    ///
    /// Used during xrun recovery: a byte written before the overrun must
    /// not wake anyone in the next cycle.
    pub fn drain(&mut self) {
        use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

        let mut scratch = [0u8; 16];
        for file in self.fds.iter().flatten() {
            // O_NONBLOCK is not set on these fds, so probe with poll.
            loop {
                let mut pfd = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
                match poll(&mut pfd, PollTimeout::ZERO) {
                    Ok(n) if n > 0 => {
                        let mut reader = file;
                        let _ = reader.read(&mut scratch);
                    }
                    _ => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn ensure_creates_opens_and_drains() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ServerDir::with_root(tmp.path(), "fifo-test");
        dir.create().unwrap();

        let mut fifos = FifoSet::new(dir.clone());
        let fd = fifos.ensure(0).unwrap();
        assert_eq!(fifos.fd(0), Some(fd));
        // Idempotent.
        assert_eq!(fifos.ensure(0).unwrap(), fd);

        // A byte written can be read back (engine holds both ends), and
        // stale bytes are drained.
        {
            let mut file = fifos.fds[0].as_ref().unwrap();
            file.write_all(&[1u8]).unwrap();
            let mut byte = [0u8; 1];
            file.read_exact(&mut byte).unwrap();
            assert_eq!(byte, [1]);
            file.write_all(&[1u8, 1u8]).unwrap();
        }
        fifos.drain();

        use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
        let file = fifos.fds[0].as_ref().unwrap();
        let mut pfd = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
        assert_eq!(poll(&mut pfd, PollTimeout::ZERO).unwrap(), 0);
    }
}
