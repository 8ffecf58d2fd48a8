//! The server thread: accept connections, serve requests, notice death.
//!
//! One poll loop watches the accept socket, the handshake ack socket and
//! every connected client's request socket. EOF or error on a client
//! socket is how client death reaches the engine outside a cycle.
//!
//! The client-fd snapshot used for polling is taken under the graph lock
//! and can go stale by the time `poll` returns; a removed client's fd
//! then reports `POLLNVAL` and is simply skipped until the next snapshot.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info, warn};

use ruteo_core::name::{from_fixed, to_fixed};
use ruteo_core::port_type::PortTypeId;
use ruteo_core::proto::{
    AckRequest, AckResult, ClientConnectRequest, ClientConnectResult, ErrorCode, RequestKind,
    RequestRecord, read_record, write_record,
};
use ruteo_core::{ClientId, PortFlags};

use crate::engine::Engine;

const POLL_INTERVAL_MS: u16 = 500;
const CLEANUP_EVERY_POLLS: u32 = 120;

/// Body of the server thread.
pub(crate) fn run(engine: &Arc<Engine>, request_listener: &UnixListener, ack_listener: &UnixListener) {
    info!(
        socket = %engine.server_dir().request_socket().display(),
        "server thread listening"
    );

    // Sweep the shm registry for dead allocators about once a minute.
    let mut sweep_countdown: u32 = CLEANUP_EVERY_POLLS;

    while engine.is_running() {
        sweep_countdown -= 1;
        if sweep_countdown == 0 {
            sweep_countdown = CLEANUP_EVERY_POLLS;
            if let Err(e) = engine.registry.cleanup() {
                warn!(error = %e, "periodic shm sweep failed");
            }
        }

        let client_fds: Vec<(ClientId, RawFd)> = {
            let graph = engine.graph.lock().unwrap();
            graph
                .clients
                .iter()
                .filter_map(|c| c.request_stream.as_ref().map(|s| (c.id(), s.as_raw_fd())))
                .collect()
        };

        let mut pfds: Vec<PollFd> = Vec::with_capacity(2 + client_fds.len());
        pfds.push(PollFd::new(request_listener.as_fd(), PollFlags::POLLIN));
        pfds.push(PollFd::new(ack_listener.as_fd(), PollFlags::POLLIN));
        for &(_, fd) in &client_fds {
            // Safety: stale fds are tolerated; poll answers POLLNVAL and
            // the next snapshot drops them.
            let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
            pfds.push(PollFd::new(bfd, PollFlags::POLLIN));
        }

        match poll(&mut pfds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::Error::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "server poll failed");
                break;
            }
        }

        let revents: Vec<PollFlags> = pfds
            .iter()
            .map(|p| p.revents().unwrap_or(PollFlags::empty()))
            .collect();

        if revents[0].contains(PollFlags::POLLIN) {
            match request_listener.accept() {
                Ok((stream, _)) => handle_new_client(engine, stream),
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
        if revents[1].contains(PollFlags::POLLIN) {
            match ack_listener.accept() {
                Ok((stream, _)) => handle_ack_connection(engine, stream),
                Err(e) => warn!(error = %e, "ack accept failed"),
            }
        }

        for (i, &(id, _)) in client_fds.iter().enumerate() {
            let r = revents[i + 2];
            if r.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                info!(id, "client socket error; removing client");
                engine.remove_client(id);
            } else if r.contains(PollFlags::POLLIN) {
                handle_client_request(engine, id);
            }
        }
    }
    debug!("server thread exiting");
}

/// First contact on the request socket: run the connect handshake.
fn handle_new_client(engine: &Arc<Engine>, mut stream: UnixStream) {
    let req: ClientConnectRequest = match read_record(&mut stream) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "unreadable connect request");
            return;
        }
    };

    let mut res = ClientConnectResult {
        status: 0,
        client_id: 0,
        realtime: u32::from(engine.cfg.realtime),
        rt_priority: engine.cfg.rt_priority - 1,
        port_segment_index: 0,
        reserved: 0,
        client_key: ruteo_core::proto::SegmentKey::null(),
        control_key: ruteo_core::proto::SegmentKey::null(),
        port_segment_key: ruteo_core::proto::SegmentKey::null(),
        fifo_prefix: [0; ruteo_core::proto::PATH_BYTES],
    };

    let stored = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot retain client socket");
            return;
        }
    };

    match engine.create_external_client(&req, stored) {
        Ok((id, client_key)) => {
            let (control_key, seg_index, seg_key) = engine.handshake_keys();
            res.client_id = id;
            res.client_key = client_key;
            res.control_key = control_key;
            res.port_segment_index = seg_index;
            res.port_segment_key = seg_key;
            res.fifo_prefix = to_fixed(
                &engine
                    .server_dir()
                    .fifo_prefix()
                    .to_string_lossy(),
            );
            if write_record(&mut stream, &res).is_err() {
                warn!(id, "handshake reply failed; dropping client");
                engine.remove_client(id);
            }
        }
        Err(code) => {
            res.status = code as i32;
            let _ = write_record(&mut stream, &res);
        }
    }
}

/// Second contact on the ack socket: bind the event channel.
fn handle_ack_connection(engine: &Arc<Engine>, mut stream: UnixStream) {
    let req: AckRequest = match read_record(&mut stream) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "unreadable ack request");
            return;
        }
    };

    let mut graph = engine.graph.lock().unwrap();
    let Some(client) = graph.client_mut(req.client_id) else {
        warn!(id = req.client_id, "ack for unknown client");
        let _ = write_record(&mut stream, &AckResult { status: ErrorCode::UnknownClient as i32 });
        return;
    };
    if write_record(&mut stream, &AckResult { status: 0 }).is_ok() {
        debug!(id = req.client_id, "event channel established");
        client.event_stream = Some(stream);
    }
}

/// One request from a connected client.
fn handle_client_request(engine: &Arc<Engine>, id: ClientId) {
    let stream = {
        let graph = engine.graph.lock().unwrap();
        graph
            .client(id)
            .and_then(|c| c.request_stream.as_ref())
            .and_then(|s| s.try_clone().ok())
    };
    let Some(mut stream) = stream else {
        return;
    };

    let mut rec: RequestRecord = match read_record(&mut stream) {
        Ok(r) => r,
        Err(_) => {
            // EOF or a torn record: the client is gone.
            info!(id, "client request channel closed; removing client");
            engine.remove_client(id);
            return;
        }
    };

    let reply = dispatch(engine, &mut rec);
    if reply && write_record(&mut stream, &rec).is_err() {
        warn!(id, "request reply failed; removing client");
        engine.remove_client(id);
    }
}

/// Run one request against the engine; returns false when no reply is
/// owed (DropClient).
fn dispatch(engine: &Arc<Engine>, rec: &mut RequestRecord) -> bool {
    let Some(kind) = RequestKind::from_raw(rec.kind) else {
        rec.status = ErrorCode::BadRequest as i32;
        return true;
    };

    let outcome: Result<(), ErrorCode> = match kind {
        RequestKind::RegisterPort => {
            let ty = PortTypeId::from_raw(rec.type_id);
            let flags = PortFlags::from_bits_truncate(rec.flags);
            match ty {
                None => Err(ErrorCode::TypeMismatch),
                Some(ty) => engine
                    .register_port(rec.client_id, from_fixed(&rec.port_name), ty, flags)
                    .map(|port| {
                        rec.port_id = port;
                    }),
            }
        }
        RequestKind::UnregisterPort => engine.unregister_port(rec.client_id, rec.port_id),
        RequestKind::ConnectPorts => engine.connect_ports(
            from_fixed(&rec.source_name),
            from_fixed(&rec.destination_name),
        ),
        RequestKind::DisconnectPorts => engine.disconnect_ports(
            from_fixed(&rec.source_name),
            from_fixed(&rec.destination_name),
        ),
        RequestKind::ActivateClient => engine.activate(rec.client_id),
        RequestKind::DeactivateClient => engine.deactivate(rec.client_id),
        RequestKind::RequestPortMonitor => engine.port_monitor(rec.port_id, true),
        RequestKind::RequestPortUnMonitor => engine.port_monitor(rec.port_id, false),
        RequestKind::SetTimeBaseClient => engine.set_timebase(rec.client_id),
        RequestKind::DropClient => {
            engine.remove_client(rec.client_id);
            return false;
        }
    };

    rec.status = match outcome {
        Ok(()) => 0,
        Err(code) => code as i32,
    };
    true
}
