//! The engine: one value owning every piece of server state.
//!
//! There is no global; `ruteod`'s main builds exactly one [`Engine`]
//! behind an `Arc` and every thread works through it. Lock order, where
//! several are held, is graph → port → buffer; the FIFO table is only
//! taken while the graph lock is held, and the cross-process registry
//! flock is strictly a leaf — registry operations never wait on any
//! engine lock.

use std::io::Read;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bytemuck::Zeroable;
use tracing::{debug, error, info, warn};

use ruteo_core::name::{from_fixed, full_name, to_fixed, validate_client_name, validate_port_name};
use ruteo_core::port_type::{self, PortTypeId};
use ruteo_core::proto::{
    ClientConnectRequest, ErrorCode, EventKind, EventRecord, SegmentKey, write_record,
};
use ruteo_core::server_dir::ServerDir;
use ruteo_core::shm_layout::{
    ClientControl, ClientKind, ClientState, EventInterest, NO_SEGMENT,
};
use ruteo_core::{ClientId, DEFAULT_PORT_MAX, Nframes, PortFlags, PortId};
use ruteo_shm::ShmRegistry;

use crate::buffers::BufferPool;
use crate::client::{ControlBlock, InProcessClient, InternalClient};
use crate::control::ControlShm;
use crate::driver::Driver;
use crate::error::EngineError;
use crate::fifo::FifoSet;
use crate::graph::{Connection, Graph};
use crate::scope::MixBuffer;
use crate::{cycle, server};

/// Engine construction parameters; the CLI maps straight onto this.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Server name; selects the server directory.
    pub server_name: String,
    /// Root for the server directory; `None` uses `/tmp`.
    pub tmp_root: Option<PathBuf>,
    /// Run the cycle thread under SCHED_FIFO with locked memory.
    pub realtime: bool,
    /// SCHED_FIFO priority for the cycle thread when realtime.
    pub rt_priority: i32,
    /// Port table capacity.
    pub port_max: u32,
    /// Default client process timeout in ms; 0 means one period.
    pub client_timeout_ms: u32,
    /// Exit when the last external client leaves.
    pub temporary: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_name: ruteo_core::server_dir::DEFAULT_SERVER_NAME.to_owned(),
            tmp_root: None,
            realtime: true,
            rt_priority: 10,
            port_max: DEFAULT_PORT_MAX,
            client_timeout_ms: 500,
            temporary: false,
        }
    }
}

/// The server's single owning value.
pub struct Engine {
    pub(crate) cfg: EngineConfig,
    pub(crate) registry: ShmRegistry,
    pub(crate) dir: ServerDir,
    pub(crate) control: ControlShm,
    pub(crate) graph: Mutex<Graph>,
    pub(crate) buffers: Mutex<BufferPool>,
    port_lock: Mutex<()>,
    pub(crate) fifos: Mutex<FifoSet>,
    /// Key and index of the current port-buffer segment, for handshakes.
    port_segment: Mutex<(i32, SegmentKey)>,
    next_client_id: AtomicU32,
    running: AtomicBool,
    had_external: AtomicBool,
}

/// Join handles for the engine's threads.
pub struct EngineHandle {
    engine: Arc<Engine>,
    server: Option<JoinHandle<()>>,
    cycle: Option<JoinHandle<()>>,
}

impl Engine {
    /// Build the engine: claim the server name, create the server
    /// directory and the shared control segment.
    pub fn new(cfg: EngineConfig) -> Result<Arc<Self>, EngineError> {
        let registry = ShmRegistry::open()?;
        registry.cleanup()?;

        let dir = match &cfg.tmp_root {
            Some(root) => ServerDir::with_root(root, &cfg.server_name),
            None => ServerDir::new(&cfg.server_name),
        };
        dir.create()?;
        registry.register_server(&dir.dir().to_string_lossy(), false)?;

        let control = ControlShm::create(&registry, cfg.port_max, cfg.realtime, cfg.rt_priority - 1)?;

        let mut fifos = FifoSet::new(dir.clone());
        fifos.ensure(0)?;

        info!(
            name = %cfg.server_name,
            dir = %dir.dir().display(),
            port_max = cfg.port_max,
            realtime = cfg.realtime,
            "engine created"
        );

        Ok(Arc::new(Self {
            registry,
            control,
            graph: Mutex::new(Graph::new()),
            buffers: Mutex::new(BufferPool::new()),
            port_lock: Mutex::new(()),
            fifos: Mutex::new(fifos),
            port_segment: Mutex::new((NO_SEGMENT, SegmentKey::null())),
            next_client_id: AtomicU32::new(1),
            running: AtomicBool::new(true),
            had_external: AtomicBool::new(false),
            dir,
            cfg,
        }))
    }

    /// Attach the driver and launch the server and cycle threads.
    pub fn start(
        self: &Arc<Self>,
        mut driver: Box<dyn Driver>,
    ) -> Result<EngineHandle, EngineError> {
        driver.attach(self)?;

        let _ = std::fs::remove_file(self.dir.request_socket());
        let _ = std::fs::remove_file(self.dir.ack_socket());
        let request_listener = UnixListener::bind(self.dir.request_socket())?;
        let ack_listener = UnixListener::bind(self.dir.ack_socket())?;

        let engine = Arc::clone(self);
        let server = std::thread::Builder::new()
            .name("ruteo-server".into())
            .spawn(move || server::run(&engine, &request_listener, &ack_listener))?;

        let engine = Arc::clone(self);
        let cycle = std::thread::Builder::new()
            .name("ruteo-cycle".into())
            .spawn(move || cycle::run(&engine, driver))?;

        Ok(EngineHandle {
            engine: Arc::clone(self),
            server: Some(server),
            cycle: Some(cycle),
        })
    }

    /// Ask every thread to wind down. Callable from any thread, any
    /// number of times.
    pub fn begin_shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("engine shutdown requested");
        }
    }

    /// Whether the engine is still meant to be running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Monotonic microseconds, shared-clock comparable with clients.
    pub fn now_usecs(&self) -> u64 {
        ruteo_core::monotonic_usecs()
    }

    /// The server directory in use.
    pub fn server_dir(&self) -> &ServerDir {
        &self.dir
    }

    /// Publish the driver's sample rate and period size and build the
    /// buffer pool for it. Driver `attach` calls this exactly once
    /// before any client can connect.
    pub fn set_audio_params(&self, sample_rate: u32, nframes: Nframes) -> Result<(), EngineError> {
        let _graph = self.graph.lock().unwrap();
        self.control.set_sample_rate(sample_rate);
        self.control.set_buffer_size(nframes);

        let buffer_bytes = nframes * size_of::<ruteo_core::Sample>() as u32;
        let mut pool = self.buffers.lock().unwrap();
        let key = pool.rebuild(&self.registry, self.cfg.port_max + 1, buffer_bytes)?;
        *self.port_segment.lock().unwrap() = (0, key);
        info!(sample_rate, nframes, "audio parameters published");
        Ok(())
    }

    // --- clients -----------------------------------------------------------

    /// Register a client that runs inside the server process.
    pub fn add_in_process_client(
        &self,
        name: &str,
        kind: ClientKind,
        handler: Option<Box<dyn InProcessClient>>,
    ) -> Result<ClientId, ErrorCode> {
        if !kind.runs_in_server() {
            return Err(ErrorCode::BadRequest);
        }
        validate_client_name(name).map_err(|_| ErrorCode::BadName)?;

        let mut graph = self.graph.lock().unwrap();
        if graph.client_by_name(name).is_some() {
            return Err(ErrorCode::NameInUse);
        }
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let mut control = ClientControl::zeroed();
        control.id = id;
        control.kind = kind as u32;
        control.pid = std::process::id() as i32;
        control.name = to_fixed(name);

        let mut client = InternalClient::new(ControlBlock::heap(control), None);
        client.handler = handler;
        graph.clients.push(client);
        info!(name, id, ?kind, "in-process client added");
        Ok(id)
    }

    /// Create the engine-side record for an external client handshake.
    /// Returns the new id and the key of its control-block segment.
    pub(crate) fn create_external_client(
        &self,
        req: &ClientConnectRequest,
        stream: UnixStream,
    ) -> Result<(ClientId, SegmentKey), ErrorCode> {
        let kind = ClientKind::from_raw(req.kind).ok_or(ErrorCode::BadRequest)?;
        if kind != ClientKind::External {
            // In-process clients are registered through the engine API,
            // not loaded from client-supplied paths.
            return Err(ErrorCode::Unsupported);
        }
        let name = from_fixed(&req.name);
        validate_client_name(name).map_err(|_| ErrorCode::BadName)?;

        let mut graph = self.graph.lock().unwrap();
        if graph.client_by_name(name).is_some() {
            return Err(ErrorCode::NameInUse);
        }

        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let seg = self
            .registry
            .alloc(size_of::<ClientControl>())
            .map_err(|_| ErrorCode::NoBuffer)?;
        let mut control = ClientControl::zeroed();
        control.id = id;
        control.kind = ClientKind::External as u32;
        control.pid = req.pid;
        control.name = to_fixed(name);
        ControlBlock::init_segment(&seg, &control);
        let key = seg.key();

        graph
            .clients
            .push(InternalClient::new(ControlBlock::shm(seg), Some(stream)));
        self.had_external.store(true, Ordering::SeqCst);
        info!(name, id, pid = req.pid, "external client connected");
        Ok((id, key))
    }

    /// What the handshake needs to tell a client where everything lives.
    pub(crate) fn handshake_keys(&self) -> (SegmentKey, i32, SegmentKey) {
        let (index, key) = *self.port_segment.lock().unwrap();
        (self.control.key(), index, key)
    }

    /// Put a client into the execution chain.
    pub fn activate(&self, id: ClientId) -> Result<(), ErrorCode> {
        let mut graph = self.graph.lock().unwrap();
        let client = graph.client(id).ok_or(ErrorCode::UnknownClient)?;
        let in_process = client.is_in_process();
        let was_active = client.control.active();
        client.control.set_active(true);
        if !in_process && !was_active {
            graph.external_count += 1;
        }
        self.sort_and_notify(&mut graph);
        debug!(id, "client activated");
        Ok(())
    }

    /// Take a client out of the chain, dropping its connections but
    /// keeping its ports.
    pub fn deactivate(&self, id: ClientId) -> Result<(), ErrorCode> {
        let mut graph = self.graph.lock().unwrap();
        self.deactivate_locked(&mut graph, id)?;
        self.sort_and_notify(&mut graph);
        Ok(())
    }

    fn deactivate_locked(&self, graph: &mut Graph, id: ClientId) -> Result<(), ErrorCode> {
        let client = graph.client(id).ok_or(ErrorCode::UnknownClient)?;
        let was_active = client.control.active();
        let in_process = client.is_in_process();
        let ports = client.ports.clone();

        if graph.timebase == Some(id) {
            graph.timebase = None;
            self.control.set_frame_time(0);
        }
        for port in ports {
            self.clear_port_connections(graph, port);
        }
        let client = graph.client(id).unwrap();
        client.control.set_active(false);
        if was_active && !in_process {
            graph.external_count = graph.external_count.saturating_sub(1);
        }
        debug!(id, "client deactivated");
        Ok(())
    }

    /// Remove a client entirely: connections, ports, chain membership,
    /// sockets, control block — in that order.
    pub fn remove_client(&self, id: ClientId) {
        let mut graph = self.graph.lock().unwrap();
        self.remove_client_locked(&mut graph, id);
        self.sort_and_notify(&mut graph);
        drop(graph);
        self.maybe_exit_temporary();
    }

    pub(crate) fn remove_client_locked(&self, graph: &mut Graph, id: ClientId) {
        let Some(client) = graph.client(id) else {
            return;
        };
        let name = client.control.name();
        info!(name = %name, id, "removing client");

        client.control.set_dead();
        client.control.set_state(ClientState::Dead);

        if self.deactivate_locked(graph, id).is_err() {
            return;
        }
        // Ports go with the client (unlike deactivation).
        let ports = graph.client(id).map(|c| c.ports.clone()).unwrap_or_default();
        for port in ports {
            self.release_port(graph, port);
        }

        if let Some(i) = graph.clients.iter().position(|c| c.id() == id) {
            let mut client = graph.clients.remove(i);
            // Close the sockets before the control block goes away; the
            // client process observes EOF first, then its mapping is the
            // only thing keeping the block alive.
            client.request_stream.take();
            client.event_stream.take();
            let control_key = client.control.key();
            drop(client);
            if let Some(key) = control_key {
                let _ = self.registry.destroy(&key);
            }
        }
    }

    /// Temporary mode: leave when the last external client has.
    pub(crate) fn maybe_exit_temporary(&self) {
        if !self.cfg.temporary || !self.had_external.load(Ordering::SeqCst) {
            return;
        }
        let graph = self.graph.lock().unwrap();
        let any_external = graph.clients.iter().any(|c| !c.is_in_process());
        drop(graph);
        if !any_external {
            info!("last client left; temporary server exiting");
            self.begin_shutdown();
        }
    }

    // --- ports -------------------------------------------------------------

    /// Register a port for `client_id`. Output ports get a buffer.
    pub fn register_port(
        &self,
        client_id: ClientId,
        short_name: &str,
        type_id: PortTypeId,
        flags: PortFlags,
    ) -> Result<PortId, ErrorCode> {
        validate_port_name(short_name).map_err(|_| ErrorCode::BadName)?;
        if !flags.direction_valid() {
            return Err(ErrorCode::WrongDirection);
        }

        let mut graph = self.graph.lock().unwrap();
        let client = graph.client(client_id).ok_or(ErrorCode::UnknownClient)?;
        let full = full_name(&client.control.name(), short_name);
        if self.port_by_name_locked(&full).is_some() {
            return Err(ErrorCode::NameInUse);
        }

        let port_id = self.allocate_port_slot().ok_or(ErrorCode::NoPortSlot)?;
        let nframes = self.control.buffer_size();
        let info = port_type::by_id(type_id);

        let mut record = self.control.read_port(port_id);
        record.client_id = client_id;
        record.flags = flags.bits();
        record.type_id = type_id as u32;
        record.buffer_segment = NO_SEGMENT;
        record.buffer_offset = 0;
        record.monitor_requests = 0;
        record.latency = 0;
        record.name = to_fixed(&full);

        if flags.is_output() {
            let mut pool = self.buffers.lock().unwrap();
            let Some(handle) = pool.acquire() else {
                drop(pool);
                self.free_port_slot(port_id);
                return Err(ErrorCode::NoBuffer);
            };
            record.buffer_segment = handle.0;
            record.buffer_offset = handle.1;
            record.buffer_bytes = pool.buffer_bytes();
            let ptr = pool.buffer_ptr(handle);
            // Safety: freshly acquired pool buffer.
            let buf = unsafe {
                std::slice::from_raw_parts_mut(ptr, pool.buffer_bytes() as usize)
            };
            (info.buffer_init)(buf, nframes);
        }

        self.control.write_port(port_id, &record);
        graph.client_mut(client_id).unwrap().ports.push(port_id);

        self.notify_port_registration(&mut graph, port_id, true);
        self.sort_and_notify(&mut graph);
        debug!(port = %full, id = port_id, "port registered");
        Ok(port_id)
    }

    /// Unregister a port owned by `client_id`.
    pub fn unregister_port(&self, client_id: ClientId, port_id: PortId) -> Result<(), ErrorCode> {
        if port_id >= self.cfg.port_max {
            return Err(ErrorCode::UnknownPort);
        }
        let mut graph = self.graph.lock().unwrap();
        let record = self.control.read_port(port_id);
        if record.in_use == 0 {
            return Err(ErrorCode::UnknownPort);
        }
        if record.client_id != client_id {
            return Err(ErrorCode::BadRequest);
        }
        self.clear_port_connections(&mut graph, port_id);
        self.release_port(&mut graph, port_id);
        self.sort_and_notify(&mut graph);
        Ok(())
    }

    /// Tear down one port completely: buffer, slot, owner list, event.
    fn release_port(&self, graph: &mut Graph, port_id: PortId) {
        self.clear_port_connections(graph, port_id);
        let record = self.control.read_port(port_id);
        if record.in_use == 0 {
            return;
        }
        if record.buffer_segment != NO_SEGMENT {
            // A tied output carries its tie target's handle; the buffer
            // goes back to the pool only when no other port still refers
            // to it.
            let handle = (record.buffer_segment, record.buffer_offset);
            let shared = (0..self.cfg.port_max).any(|other| {
                if other == port_id {
                    return false;
                }
                let o = self.control.read_port(other);
                o.in_use != 0 && (o.buffer_segment, o.buffer_offset) == handle
            });
            if !shared {
                self.buffers.lock().unwrap().release(handle);
            }
        }
        if let Some(owner) = graph.client_mut(record.client_id) {
            owner.ports.retain(|&p| p != port_id);
        }
        self.notify_port_registration(graph, port_id, false);
        self.free_port_slot(port_id);
    }

    fn allocate_port_slot(&self) -> Option<PortId> {
        let _guard = self.port_lock.lock().unwrap();
        for id in 0..self.cfg.port_max {
            let mut record = self.control.read_port(id);
            if record.in_use == 0 {
                record.in_use = 1;
                self.control.write_port(id, &record);
                return Some(id);
            }
        }
        None
    }

    fn free_port_slot(&self, port_id: PortId) {
        let _guard = self.port_lock.lock().unwrap();
        let mut record: ruteo_core::shm_layout::PortRecord = Zeroable::zeroed();
        record.id = port_id;
        record.buffer_segment = NO_SEGMENT;
        self.control.write_port(port_id, &record);
    }

    /// Peer ports connected to `port`, from either end.
    pub fn port_connections(&self, port: PortId) -> Vec<PortId> {
        let graph = self.graph.lock().unwrap();
        graph
            .connections_of(port)
            .iter()
            .map(|c| {
                if c.src_port == port {
                    c.dst_port
                } else {
                    c.src_port
                }
            })
            .collect()
    }

    /// Find an in-use port by full name.
    pub fn port_by_name(&self, name: &str) -> Option<PortId> {
        let _graph = self.graph.lock().unwrap();
        self.port_by_name_locked(name)
    }

    fn port_by_name_locked(&self, name: &str) -> Option<PortId> {
        (0..self.cfg.port_max).find(|&id| {
            let record = self.control.read_port(id);
            record.in_use != 0 && from_fixed(&record.name) == name
        })
    }

    // --- connections -------------------------------------------------------

    /// Connect `src` to `dst` by full name, with the full validation
    /// ladder, then resort the graph and notify both owners.
    pub fn connect_ports(&self, src: &str, dst: &str) -> Result<(), ErrorCode> {
        let mut graph = self.graph.lock().unwrap();

        let src_id = self.port_by_name_locked(src).ok_or(ErrorCode::UnknownPort)?;
        let dst_id = self.port_by_name_locked(dst).ok_or(ErrorCode::UnknownPort)?;
        let src_rec = self.control.read_port(src_id);
        let dst_rec = self.control.read_port(dst_id);

        if !PortFlags::from_bits_truncate(src_rec.flags).is_output() {
            return Err(ErrorCode::WrongDirection);
        }
        if !PortFlags::from_bits_truncate(dst_rec.flags).is_input() {
            return Err(ErrorCode::WrongDirection);
        }
        if src_rec.type_id != dst_rec.type_id {
            return Err(ErrorCode::TypeMismatch);
        }
        // Inactive clients hold no connections; connect comes after
        // activation.
        for owner in [src_rec.client_id, dst_rec.client_id] {
            if !graph.client(owner).is_some_and(|c| c.control.active()) {
                return Err(ErrorCode::BadRequest);
            }
        }
        let ty = PortTypeId::from_raw(dst_rec.type_id)
            .map(port_type::by_id)
            .ok_or(ErrorCode::TypeMismatch)?;
        if graph.fan_in(dst_id) > 0 && ty.mixdown.is_none() {
            return Err(ErrorCode::NoMixdown);
        }
        if graph.would_cycle(src_rec.client_id, dst_rec.client_id) {
            return Err(ErrorCode::WouldCycle);
        }

        graph.connections.push(Connection {
            src_port: src_id,
            dst_port: dst_id,
            src_client: src_rec.client_id,
            dst_client: dst_rec.client_id,
        });
        self.refresh_mix_buffer(&mut graph, dst_id, dst_rec.client_id);
        self.sort_and_notify(&mut graph);
        self.notify_connection(&mut graph, src_id, dst_id, true);
        info!(src, dst, "ports connected");
        Ok(())
    }

    /// Remove the connection between `src` and `dst`.
    pub fn disconnect_ports(&self, src: &str, dst: &str) -> Result<(), ErrorCode> {
        let mut graph = self.graph.lock().unwrap();
        let src_id = self.port_by_name_locked(src).ok_or(ErrorCode::UnknownPort)?;
        let dst_id = self.port_by_name_locked(dst).ok_or(ErrorCode::UnknownPort)?;
        self.disconnect_locked(&mut graph, src_id, dst_id)?;
        self.sort_and_notify(&mut graph);
        Ok(())
    }

    fn disconnect_locked(
        &self,
        graph: &mut Graph,
        src_id: PortId,
        dst_id: PortId,
    ) -> Result<(), ErrorCode> {
        let at = graph
            .connections
            .iter()
            .position(|c| c.src_port == src_id && c.dst_port == dst_id)
            .ok_or(ErrorCode::NotConnected)?;
        let conn = graph.connections.remove(at);
        self.refresh_mix_buffer(graph, dst_id, conn.dst_client);
        self.notify_connection(graph, src_id, dst_id, false);
        Ok(())
    }

    /// Drop every connection touching `port`, notifying affected peers.
    fn clear_port_connections(&self, graph: &mut Graph, port: PortId) {
        loop {
            let Some(conn) = graph.connections_of(port).first().copied() else {
                break;
            };
            let _ = self.disconnect_locked(graph, conn.src_port, conn.dst_port);
        }
    }

    /// Keep the engine-side mix buffer in step with a port's fan-in.
    /// Only inputs owned by in-process clients need one.
    fn refresh_mix_buffer(&self, graph: &mut Graph, port: PortId, owner: ClientId) {
        let needs = graph.fan_in(port) >= 2
            && graph.client(owner).is_some_and(InternalClient::is_in_process);
        if needs {
            let bytes = self.buffers.lock().unwrap().buffer_bytes() as usize;
            graph
                .mix_buffers
                .entry(port)
                .or_insert_with(|| MixBuffer::new(bytes));
        } else {
            graph.mix_buffers.remove(&port);
        }
    }

    // --- monitoring and timebase ------------------------------------------

    /// Raise or drop a monitor request on `port`.
    pub fn port_monitor(&self, port_id: PortId, on: bool) -> Result<(), ErrorCode> {
        if port_id >= self.cfg.port_max {
            return Err(ErrorCode::UnknownPort);
        }
        let mut graph = self.graph.lock().unwrap();
        let mut record = self.control.read_port(port_id);
        if record.in_use == 0 {
            return Err(ErrorCode::UnknownPort);
        }
        let before = record.monitor_requests;
        record.monitor_requests = if on {
            before + 1
        } else {
            before.saturating_sub(1)
        };
        self.control.write_port(port_id, &record);

        let kind = match (before, record.monitor_requests) {
            (0, 1) => Some(EventKind::PortMonitor),
            (1, 0) => Some(EventKind::PortUnMonitor),
            _ => None,
        };
        if let Some(kind) = kind {
            let owner = record.client_id;
            if let Some(client) = graph.client_mut(owner) {
                if client.control.interest().contains(EventInterest::PORT_MONITOR) {
                    Self::deliver_event(client, &EventRecord::new(kind, port_id, 0));
                }
            }
        }
        Ok(())
    }

    /// Nominate the transport timebase client.
    pub fn set_timebase(&self, client_id: ClientId) -> Result<(), ErrorCode> {
        let mut graph = self.graph.lock().unwrap();
        let client = graph.client(client_id).ok_or(ErrorCode::UnknownClient)?;
        self.control.set_frame_time(client.control.frame_time());
        graph.timebase = Some(client_id);
        Ok(())
    }

    // --- reconfiguration ---------------------------------------------------

    /// Switch to a new period size: rebuild the pool, re-buffer every
    /// output port, and tell every client before the next cycle can use
    /// the new size.
    pub fn set_buffer_size(&self, nframes: Nframes) -> Result<(), EngineError> {
        let mut graph = self.graph.lock().unwrap();
        let buffer_bytes = nframes * size_of::<ruteo_core::Sample>() as u32;

        let key = {
            let mut pool = self.buffers.lock().unwrap();
            let key = pool.rebuild(&self.registry, self.cfg.port_max + 1, buffer_bytes)?;
            for id in 0..self.cfg.port_max {
                let mut record = self.control.read_port(id);
                if record.in_use == 0 {
                    continue;
                }
                if PortFlags::from_bits_truncate(record.flags).is_output() {
                    let handle = pool
                        .acquire()
                        .ok_or(EngineError::Internal("pool smaller than port table"))?;
                    record.buffer_segment = handle.0;
                    record.buffer_offset = handle.1;
                    record.buffer_bytes = pool.buffer_bytes();
                    let info = port_type::by_id(
                        PortTypeId::from_raw(record.type_id)
                            .ok_or(EngineError::Internal("unknown port type in table"))?,
                    );
                    let ptr = pool.buffer_ptr(handle);
                    // Safety: freshly acquired pool buffer.
                    let buf = unsafe {
                        std::slice::from_raw_parts_mut(ptr, pool.buffer_bytes() as usize)
                    };
                    (info.buffer_init)(buf, nframes);
                    self.control.write_port(id, &record);
                }
            }
            key
        };
        *self.port_segment.lock().unwrap() = (0, key);

        // Mix buffers are sized to the period too.
        let ports: Vec<(PortId, ClientId)> = graph
            .mix_buffers
            .keys()
            .map(|&p| (p, self.control.read_port(p).client_id))
            .collect();
        graph.mix_buffers.clear();
        for (port, owner) in ports {
            self.refresh_mix_buffer(&mut graph, port, owner);
        }

        self.control.set_buffer_size(nframes);

        let mut segment_event = EventRecord::new(EventKind::NewPortBufferSegment, 0, 0);
        segment_event.segment = key;
        self.broadcast(&mut graph, &segment_event, None);
        self.broadcast(
            &mut graph,
            &EventRecord::new(EventKind::BufferSizeChange, nframes, 0),
            Some(EventInterest::BUFFER_SIZE),
        );
        info!(nframes, "buffer size changed");
        Ok(())
    }

    /// Publish a new sample rate.
    pub fn set_sample_rate(&self, rate: u32) {
        let mut graph = self.graph.lock().unwrap();
        self.control.set_sample_rate(rate);
        self.broadcast(
            &mut graph,
            &EventRecord::new(EventKind::SampleRateChange, rate, 0),
            Some(EventInterest::SAMPLE_RATE),
        );
    }

    // --- events ------------------------------------------------------------

    /// Deliver one event to one client: direct call in-process, record
    /// plus status-byte ack over the event socket otherwise.
    pub(crate) fn deliver_event(client: &mut InternalClient, event: &EventRecord) {
        if client.control.dead() {
            return;
        }
        if client.is_in_process() {
            if let Some(handler) = client.handler.as_mut() {
                handler.handle_event(event);
            }
            return;
        }
        // An external client only reads events once activated (its event
        // thread starts then); writing earlier would hang on the ack.
        if !client.control.active() {
            return;
        }
        let Some(stream) = client.event_stream.as_mut() else {
            // Handshake incomplete; the client will catch up from shared
            // state when it finishes connecting.
            return;
        };
        if let Err(e) = write_record(stream, event) {
            warn!(client = %client.control.name(), error = %e, "event write failed");
            return;
        }
        let mut status = [0u8; 1];
        if let Err(e) = stream.read_exact(&mut status) {
            warn!(client = %client.control.name(), error = %e, "event ack failed");
        }
    }

    fn broadcast(
        &self,
        graph: &mut Graph,
        event: &EventRecord,
        interest: Option<EventInterest>,
    ) {
        for client in &mut graph.clients {
            if !client.control.active() {
                continue;
            }
            if let Some(bit) = interest {
                if !client.is_in_process() && !client.control.interest().contains(bit) {
                    continue;
                }
            }
            Self::deliver_event(client, event);
        }
    }

    fn notify_port_registration(&self, graph: &mut Graph, port_id: PortId, registered: bool) {
        let kind = if registered {
            EventKind::PortRegistered
        } else {
            EventKind::PortUnregistered
        };
        self.broadcast(
            graph,
            &EventRecord::new(kind, port_id, 0),
            Some(EventInterest::PORT_REGISTER),
        );
    }

    /// Connection events always reach both owners — the client library
    /// needs them to keep buffer resolution correct.
    fn notify_connection(&self, graph: &mut Graph, src: PortId, dst: PortId, connected: bool) {
        let kind = if connected {
            EventKind::PortConnected
        } else {
            EventKind::PortDisconnected
        };
        let src_owner = self.control.read_port(src).client_id;
        let dst_owner = self.control.read_port(dst).client_id;
        if let Some(client) = graph.client_mut(src_owner) {
            Self::deliver_event(client, &EventRecord::new(kind, src, dst));
        }
        if dst_owner != src_owner {
            if let Some(client) = graph.client_mut(dst_owner) {
                Self::deliver_event(client, &EventRecord::new(kind, dst, src));
            }
        }
    }

    /// Tell everyone who cares that the driver overran.
    pub(crate) fn notify_xrun(&self, graph: &mut Graph) {
        self.broadcast(
            graph,
            &EventRecord::new(EventKind::XRun, 0, 0),
            Some(EventInterest::XRUN),
        );
    }

    /// Resort the chain and send `GraphReordered` to every external
    /// client whose position changed.
    pub(crate) fn sort_and_notify(&self, graph: &mut Graph) {
        let notify = {
            let mut fifos = self.fifos.lock().unwrap();
            match graph.sort(&mut fifos) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "chain rebuild failed");
                    return;
                }
            }
        };
        for (id, rank) in notify {
            if let Some(client) = graph.client_mut(id) {
                Self::deliver_event(
                    client,
                    &EventRecord::new(EventKind::GraphReordered, rank, 0),
                );
            }
        }
    }

    // --- teardown ----------------------------------------------------------

    /// Final cleanup after the threads have joined: drop every client,
    /// release shared memory, give back the server name and directory.
    pub fn teardown(&self) {
        let ids: Vec<ClientId> = {
            let graph = self.graph.lock().unwrap();
            graph.clients.iter().map(InternalClient::id).collect()
        };
        for id in ids {
            let mut graph = self.graph.lock().unwrap();
            self.remove_client_locked(&mut graph, id);
        }
        if let Err(e) = self.buffers.lock().unwrap().destroy_all(&self.registry) {
            warn!(error = %e, "buffer pool teardown failed");
        }
        if let Err(e) = self.registry.destroy(&self.control.key()) {
            warn!(error = %e, "control segment teardown failed");
        }
        if let Err(e) = self.registry.unregister_server() {
            warn!(error = %e, "server unregister failed");
        }
        if let Err(e) = self.dir.remove() {
            warn!(error = %e, "server directory removal failed");
        }
        info!("engine torn down");
    }
}

impl EngineHandle {
    /// The engine behind this handle.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Block until the engine stops (driver-fatal, temporary-mode exit
    /// or [`Engine::begin_shutdown`]), then tear everything down.
    pub fn wait(mut self) {
        if let Some(h) = self.cycle.take() {
            let _ = h.join();
        }
        self.engine.begin_shutdown();
        if let Some(h) = self.server.take() {
            let _ = h.join();
        }
        self.engine.teardown();
    }

    /// Stop the engine and tear everything down.
    pub fn shutdown(self) {
        self.engine.begin_shutdown();
        self.wait();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("server", &self.cfg.server_name)
            .field("port_max", &self.cfg.port_max)
            .finish_non_exhaustive()
    }
}
