//! The cycle thread: drive the driver, walk the chain, recover.
//!
//! One cycle is: wait on the driver, latch capture buffers in, wake the
//! chain (direct calls for in-process clients, one byte down the FIFO
//! per external subgraph), post playback buffers back, and — if anything
//! went wrong — remove whoever was left mid-cycle and rebuild the chain.
//!
//! The walk holds the graph lock by try-lock: if a mutation owns it, the
//! whole cycle is skipped rather than making the driver deadline wait.
//! Inside the cycle the only blocking points are the driver's own wait,
//! `poll`, and one-byte FIFO reads and writes.

use std::os::fd::BorrowedFd;
use std::sync::Arc;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::{read, write};
use tracing::{debug, error, info, trace, warn};

use ruteo_core::Nframes;
use ruteo_core::shm_layout::{ClientKind, ClientState};

use crate::client::InternalClient;
use crate::driver::{Driver, WaitStatus};
use crate::engine::Engine;
use crate::scope::ProcessScope;

/// Body of the cycle thread.
pub(crate) fn run(engine: &Arc<Engine>, mut driver: Box<dyn Driver>) {
    if engine.cfg.realtime {
        become_realtime(engine.cfg.rt_priority);
    }

    if let Err(e) = driver.start() {
        error!(error = %e, "driver failed to start");
        engine.begin_shutdown();
    }

    while engine.is_running() {
        let wait = driver.wait();
        match wait.status {
            WaitStatus::Ready => {
                if wait.nframes == 0 {
                    continue;
                }
                if let Err(e) = run_cycle(engine, &mut *driver, wait.nframes) {
                    error!(error = %e, "cycle failed; shutting down");
                    engine.begin_shutdown();
                }
            }
            WaitStatus::Interrupted => {}
            WaitStatus::Timeout => xrun_recover(engine, &mut *driver, wait.delayed_usecs),
            WaitStatus::Fatal => {
                error!("driver reported fatal error");
                engine.begin_shutdown();
            }
        }
    }

    if let Err(e) = driver.stop() {
        warn!(error = %e, "driver stop failed");
    }
    if let Err(e) = driver.detach(engine) {
        warn!(error = %e, "driver detach failed");
    }
    debug!("cycle thread exiting");
}

/// One period.
fn run_cycle(
    engine: &Arc<Engine>,
    driver: &mut dyn Driver,
    nframes: Nframes,
) -> Result<(), crate::error::EngineError> {
    // A mutation owns the graph: skip this cycle whole. The driver has
    // already consumed its period; nothing is half-run.
    let Ok(mut graph) = engine.graph.try_lock() else {
        trace!("graph contended; cycle skipped");
        return Ok(());
    };

    engine.control.set_cycle_start_usecs(engine.now_usecs());
    if let Some(tb) = graph.timebase {
        if let Some(client) = graph.client(tb) {
            engine.control.set_frame_time(client.control.frame_time());
        }
    }

    for client in &graph.clients {
        client.control.set_state(ClientState::NotTriggered);
        client.control.set_nframes(nframes);
    }

    let have_graph = graph
        .clients
        .iter()
        .any(|c| c.control.active() && c.control.kind() != ClientKind::Driver);

    let mut chain_failed = false;

    {
        let pool = engine.buffers.lock().unwrap();
        let crate::graph::Graph {
            clients,
            connections,
            mix_buffers,
            ..
        } = &mut *graph;
        let scope = ProcessScope::new(
            nframes,
            &engine.control,
            &pool,
            connections.as_slice(),
            &*mix_buffers,
        );

        if !have_graph {
            driver.null_cycle(&scope, nframes)?;
            return Ok(());
        }

        driver.read(&scope, nframes)?;

        let mut i = 0;
        while i < clients.len() {
            if !clients[i].control.active() {
                i += 1;
                continue;
            }
            match clients[i].control.kind() {
                ClientKind::Driver => {
                    clients[i].control.set_state(ClientState::Finished);
                    i += 1;
                }
                ClientKind::InProcess => {
                    let mut handler = clients[i].handler.take();
                    let outcome = handler
                        .as_mut()
                        .map_or(Ok(()), |h| h.process(&scope, nframes));
                    clients[i].handler = handler;
                    if outcome.is_err() {
                        warn!(
                            client = %clients[i].control.name(),
                            "in-process client failed; abandoning cycle"
                        );
                        clients[i].control.set_state(ClientState::Triggered);
                        chain_failed = true;
                        break;
                    }
                    clients[i].control.set_state(ClientState::Finished);
                    i += 1;
                }
                ClientKind::External => {
                    // Head of an external subgraph: one byte starts it,
                    // the members hand off among themselves, and the
                    // FIFO after the last member reports completion.
                    let end = subgraph_end(clients, i);
                    let timeout = subgraph_timeout_ms(engine, driver, Some(&clients[i]));
                    if !run_subgraph(&clients[i], timeout) {
                        mark_subgraph_culprit(&clients[i..end]);
                        chain_failed = true;
                        break;
                    }
                    i = end;
                }
            }
        }

        // Whatever completed still reaches the hardware.
        driver.write(&scope, nframes)?;
    }

    if chain_failed {
        cleanup_failed_clients(engine, &mut graph);
        engine.sort_and_notify(&mut graph);
        drop(graph);
        engine.maybe_exit_temporary();
    }
    Ok(())
}

/// Index one past the last member of the subgraph headed at `i`.
///
/// A subgraph is only broken by an *active* in-process client — exactly
/// the rule the rechain walk uses — so inactive entries in between are
/// stepped over.
fn subgraph_end(clients: &[InternalClient], i: usize) -> usize {
    let mut end = i + 1;
    while end < clients.len() {
        let c = &clients[end];
        if !c.control.active() || c.control.kind() == ClientKind::External {
            end += 1;
        } else {
            break;
        }
    }
    end
}

/// Write the start byte, wait for completion, eat the completion byte.
/// False on timeout or FIFO error.
fn run_subgraph(head: &InternalClient, timeout_ms: u16) -> bool {
    let (Some(start_fd), Some(wait_fd)) = (head.subgraph_start, head.subgraph_wait) else {
        warn!(client = %head.control.name(), "subgraph head without fifos");
        return false;
    };

    // Safety: the fds live in the engine's FIFO table, which outlives
    // every cycle.
    let start = unsafe { BorrowedFd::borrow_raw(start_fd) };
    let waitb = unsafe { BorrowedFd::borrow_raw(wait_fd) };

    if write(start, &[0u8]) != Ok(1) {
        warn!(client = %head.control.name(), "cannot start subgraph");
        return false;
    }

    let mut pfd = [PollFd::new(waitb, PollFlags::POLLIN)];
    match poll(&mut pfd, PollTimeout::from(timeout_ms)) {
        Ok(n) if n > 0 => {}
        Ok(_) => {
            warn!(
                client = %head.control.name(),
                timeout_ms, "subgraph timed out"
            );
            return false;
        }
        Err(e) => {
            warn!(client = %head.control.name(), error = %e, "subgraph poll failed");
            return false;
        }
    }
    let revents = pfd[0].revents().unwrap_or(PollFlags::empty());
    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
        warn!(client = %head.control.name(), "error or hangup on subgraph wait fd");
        return false;
    }

    let mut byte = [0u8; 1];
    read(wait_fd, &mut byte) == Ok(1)
}

/// Blame the first running member of a failed subgraph that did not
/// finish: either it hung mid-callback (Triggered) or died before
/// reading its wakeup (NotTriggered). Finished members are innocent.
fn mark_subgraph_culprit(members: &[InternalClient]) {
    for client in members {
        if !client.control.active() {
            continue;
        }
        match client.control.state() {
            ClientState::Finished => {}
            _ => {
                client.control.set_state(ClientState::TimedOut);
                return;
            }
        }
    }
}

/// Remove every client the abandoned cycle left mid-flight.
fn cleanup_failed_clients(engine: &Engine, graph: &mut crate::graph::Graph) {
    let doomed: Vec<_> = graph
        .clients
        .iter()
        .filter(|c| {
            matches!(
                c.control.state(),
                ClientState::Triggered | ClientState::TimedOut
            )
        })
        .map(InternalClient::id)
        .collect();
    for id in doomed {
        info!(id, "removing client left mid-cycle");
        engine.remove_client_locked(graph, id);
    }
}

/// Poll deadline for one subgraph: the client's own timeout when set,
/// else the configured engine default, else one period.
fn subgraph_timeout_ms(
    engine: &Engine,
    driver: &dyn Driver,
    head: Option<&InternalClient>,
) -> u16 {
    let ms = head
        .map(|c| c.control.timeout_msecs())
        .filter(|&t| t != 0)
        .or(Some(engine.cfg.client_timeout_ms).filter(|&t| t != 0))
        .unwrap_or_else(|| (driver.period_usecs() / 1000).max(1) as u32);
    u16::try_from(ms).unwrap_or(u16::MAX)
}

/// Driver overran: restart the stream, flush stale wakeups, tell clients.
fn xrun_recover(engine: &Arc<Engine>, driver: &mut dyn Driver, delayed_usecs: u64) {
    warn!(delayed_usecs, "xrun: restarting driver");
    if let Err(e) = driver.stop() {
        warn!(error = %e, "driver stop during xrun recovery failed");
    }
    engine.fifos.lock().unwrap().drain();
    if let Err(e) = driver.start() {
        error!(error = %e, "driver restart after xrun failed");
        engine.begin_shutdown();
        return;
    }
    let mut graph = engine.graph.lock().unwrap();
    engine.notify_xrun(&mut graph);
}

/// Best-effort SCHED_FIFO plus locked memory for the cycle thread.
fn become_realtime(priority: i32) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // Safety: plain syscall; on Linux pid 0 targets the calling thread.
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &raw const param) };
    if rc != 0 {
        warn!(
            priority,
            error = %std::io::Error::last_os_error(),
            "cannot acquire realtime scheduling"
        );
    }

    use nix::sys::mman::{MlockAllFlags, mlockall};
    if let Err(e) = mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        warn!(error = %e, "cannot lock memory for the cycle thread");
    }
}
