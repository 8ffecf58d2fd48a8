//! The client's event thread.
//!
//! One thread owns the event socket and, once the server has placed the
//! client in its chain, the pair of wakeup FIFOs. It answers server
//! events, and when the previous stage of the graph writes the wakeup
//! byte it runs the user's process callback and passes the byte on.
//! Events and process wakeups therefore never race each other.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, warn};

use ruteo_core::proto::{EventKind, EventRecord, read_record};
use ruteo_core::server_dir::fifo_at;
use ruteo_core::shm_layout::ClientState;

use crate::client::Inner;
use crate::port::{ClientScope, refresh_mix, resize_mix_buffers};

const POLL_INTERVAL_MS: u16 = 500;

pub(crate) fn run(inner: &Arc<Inner>) {
    let Some(mut event_stream) = inner.event_stream.lock().unwrap().take() else {
        return;
    };
    let mut graph_wait: Option<File> = None;
    let mut graph_next: Option<File> = None;

    loop {
        if inner.closing.load(Ordering::SeqCst) {
            break;
        }

        let (event_revents, wait_revents) = {
            let mut pfds = vec![PollFd::new(event_stream.as_fd(), PollFlags::POLLIN)];
            if let Some(w) = &graph_wait {
                pfds.push(PollFd::new(w.as_fd(), PollFlags::POLLIN));
            }
            match poll(&mut pfds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "client poll failed");
                    break;
                }
            }
            (
                pfds[0].revents().unwrap_or(PollFlags::empty()),
                pfds.get(1).and_then(|p| p.revents()).unwrap_or(PollFlags::empty()),
            )
        };

        if event_revents
            .intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
        {
            server_gone(inner);
            break;
        }

        if event_revents.contains(PollFlags::POLLIN)
            && handle_event(inner, &mut event_stream, &mut graph_wait, &mut graph_next).is_err()
        {
            server_gone(inner);
            break;
        }

        if wait_revents.contains(PollFlags::POLLIN) {
            if let Some(wait) = graph_wait.as_mut() {
                process_wakeup(inner, wait, graph_next.as_mut());
            }
        }
    }
    debug!(client = %inner.name, "event thread exiting");
}

/// The event socket died. Unless we are closing ourselves, that means
/// the server shut down or dropped us.
fn server_gone(inner: &Arc<Inner>) {
    if inner.closing.swap(true, Ordering::SeqCst) {
        return;
    }
    warn!(client = %inner.name, "server closed the event channel");
    if let Some(cb) = inner.callbacks.lock().unwrap().shutdown.as_mut() {
        cb();
    }
}

/// Read one event, act on it, acknowledge with a status byte.
fn handle_event(
    inner: &Arc<Inner>,
    stream: &mut std::os::unix::net::UnixStream,
    graph_wait: &mut Option<File>,
    graph_next: &mut Option<File>,
) -> Result<(), ()> {
    let event: EventRecord = read_record(stream).map_err(|_| ())?;
    let mut status = 0u8;

    match EventKind::from_raw(event.kind) {
        Some(EventKind::GraphReordered) => match reopen_fifos(inner, event.a) {
            Ok((wait, next)) => {
                *graph_wait = Some(wait);
                *graph_next = Some(next);
            }
            Err(e) => {
                warn!(rank = event.a, error = %e, "cannot open chain fifos");
                status = 1;
            }
        },
        Some(EventKind::PortConnected) => {
            let mut ports = inner.ports.lock().unwrap();
            if let Some(state) = ports.get_mut(&event.a) {
                if state.flags.is_input() && !state.sources.contains(&event.b) {
                    state.sources.push(event.b);
                    refresh_mix(state, inner.control.buffer_size() as usize);
                }
            }
        }
        Some(EventKind::PortDisconnected) => {
            let mut ports = inner.ports.lock().unwrap();
            if let Some(state) = ports.get_mut(&event.a) {
                state.sources.retain(|&p| p != event.b);
                refresh_mix(state, inner.control.buffer_size() as usize);
            }
        }
        Some(EventKind::NewPortBufferSegment) => {
            match ruteo_shm::Segment::attach_key(&event.segment) {
                Ok(seg) => {
                    let index = event.a as i32;
                    inner.segments.lock().unwrap().insert(index, seg);
                    inner.current_segment.store(index, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(error = %e, "cannot attach new port segment");
                    status = 1;
                }
            }
        }
        Some(EventKind::BufferSizeChange) => {
            resize_mix_buffers(
                &mut inner.ports.lock().unwrap(),
                event.a as usize,
            );
            if let Some(cb) = inner.callbacks.lock().unwrap().buffer_size.as_mut() {
                cb(event.a);
            }
        }
        Some(EventKind::SampleRateChange) => {
            if let Some(cb) = inner.callbacks.lock().unwrap().sample_rate.as_mut() {
                cb(event.a);
            }
        }
        Some(EventKind::PortRegistered) => {
            if let Some(cb) = inner.callbacks.lock().unwrap().port_registration.as_mut() {
                cb(event.a, true);
            }
        }
        Some(EventKind::PortUnregistered) => {
            if let Some(cb) = inner.callbacks.lock().unwrap().port_registration.as_mut() {
                cb(event.a, false);
            }
        }
        Some(EventKind::PortMonitor) => {
            if let Some(cb) = inner.callbacks.lock().unwrap().port_monitor.as_mut() {
                cb(event.a, true);
            }
        }
        Some(EventKind::PortUnMonitor) => {
            if let Some(cb) = inner.callbacks.lock().unwrap().port_monitor.as_mut() {
                cb(event.a, false);
            }
        }
        Some(EventKind::XRun) => {
            if let Some(cb) = inner.callbacks.lock().unwrap().xrun.as_mut() {
                cb();
            }
        }
        None => status = 1,
    }

    stream.write_all(&[status]).map_err(|_| ())
}

/// Swap to the FIFO pair for a new chain rank.
fn reopen_fifos(inner: &Arc<Inner>, rank: u32) -> std::io::Result<(File, File)> {
    // The server already holds both ends of every FIFO it names, so
    // neither open blocks.
    let wait = File::open(fifo_at(&inner.fifo_prefix, rank))?;
    let next = OpenOptions::new()
        .write(true)
        .open(fifo_at(&inner.fifo_prefix, rank + 1))?;
    debug!(client = %inner.name, rank, "joined chain");
    Ok((wait, next))
}

/// The previous stage told us to run.
fn process_wakeup(inner: &Arc<Inner>, wait: &mut File, next: Option<&mut File>) {
    inner.own.set_state(ClientState::Triggered);

    let mut byte = [0u8; 1];
    if wait.read_exact(&mut byte).is_err() {
        // Desynchronized; the server's poll timeout deals with us.
        return;
    }

    let nframes = inner.own.nframes();
    let scope = ClientScope { inner, nframes };
    let ok = {
        let mut callbacks = inner.callbacks.lock().unwrap();
        match callbacks.process.as_mut() {
            Some(cb) => cb(&scope, nframes).is_ok(),
            None => true,
        }
    };
    if ok {
        inner.own.set_state(ClientState::Finished);
    }

    // Hand off regardless; a failed callback is reported through our
    // state, not by stalling the chain.
    if let Some(next) = next {
        let _ = next.write_all(&[0u8]);
    }
}
