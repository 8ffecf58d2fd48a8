//! The client handle: handshake, requests, lifecycle.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info};

use ruteo_core::name::{from_fixed, to_fixed, validate_port_name};
use ruteo_core::port_type::PortTypeId;
use ruteo_core::proto::{
    AckRequest, AckResult, ClientConnectRequest, ClientConnectResult, ErrorCode, RequestKind,
    RequestRecord, read_record, write_record,
};
use ruteo_core::server_dir::ServerDir;
use ruteo_core::shm_layout::{ClientKind, EventInterest};
use ruteo_core::{ClientId, Nframes, PortFlags, PortId};
use ruteo_shm::Segment;

use crate::control_view::{ControlView, OwnControl};
use crate::port::{ClientScope, Port, PortDirection, PortState};
use crate::{ClientError, thread};

/// Returned by a process callback to abandon the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessFailed;

pub(crate) type ProcessCallback =
    Box<dyn FnMut(&ClientScope<'_>, Nframes) -> Result<(), ProcessFailed> + Send>;

/// User callbacks, all run on the event thread.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub process: Option<ProcessCallback>,
    pub buffer_size: Option<Box<dyn FnMut(Nframes) + Send>>,
    pub sample_rate: Option<Box<dyn FnMut(u32) + Send>>,
    pub port_registration: Option<Box<dyn FnMut(PortId, bool) + Send>>,
    pub port_monitor: Option<Box<dyn FnMut(PortId, bool) + Send>>,
    pub xrun: Option<Box<dyn FnMut() + Send>>,
    pub shutdown: Option<Box<dyn FnMut() + Send>>,
}

/// Client state shared with the event thread.
pub(crate) struct Inner {
    pub id: ClientId,
    pub name: String,
    pub request: Mutex<UnixStream>,
    pub event_stream: Mutex<Option<UnixStream>>,
    pub control: ControlView,
    pub own: OwnControl,
    pub segments: Mutex<HashMap<i32, Segment>>,
    pub current_segment: AtomicI32,
    pub ports: Mutex<HashMap<PortId, PortState>>,
    pub callbacks: Mutex<Callbacks>,
    pub fifo_prefix: PathBuf,
    pub closing: AtomicBool,
}

/// A connection to a ruteo server.
pub struct Client {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
    active: bool,
}

impl Client {
    /// Connect to the named server under the default tmp root.
    pub fn connect(server_name: &str, client_name: &str) -> Result<Self, ClientError> {
        Self::connect_with_root(None, server_name, client_name)
    }

    /// Connect to a server whose directory lives under `root`.
    pub fn connect_with_root(
        root: Option<&Path>,
        server_name: &str,
        client_name: &str,
    ) -> Result<Self, ClientError> {
        ruteo_core::name::validate_client_name(client_name)?;
        let dir = match root {
            Some(root) => ServerDir::with_root(root, server_name),
            None => ServerDir::new(server_name),
        };

        let mut stream =
            UnixStream::connect(dir.request_socket()).map_err(ClientError::Connect)?;
        let req = ClientConnectRequest {
            kind: ClientKind::External as u32,
            pid: std::process::id() as i32,
            name: to_fixed(client_name),
            load_path: [0; ruteo_core::proto::PATH_BYTES],
        };
        write_record(&mut stream, &req)?;
        let res: ClientConnectResult = read_record(&mut stream)?;
        if res.status != 0 {
            return Err(ClientError::Request(
                ErrorCode::from_raw(res.status).unwrap_or(ErrorCode::BadRequest),
            ));
        }

        let control = ControlView::new(Segment::attach_key(&res.control_key)?);
        let own = OwnControl::new(Segment::attach_key(&res.client_key)?);
        let mut segments = HashMap::new();
        segments.insert(
            res.port_segment_index,
            Segment::attach_key(&res.port_segment_key)?,
        );

        let mut ack = UnixStream::connect(dir.ack_socket()).map_err(ClientError::Connect)?;
        write_record(&mut ack, &AckRequest { client_id: res.client_id })?;
        let ack_res: AckResult = read_record(&mut ack)?;
        if ack_res.status != 0 {
            return Err(ClientError::Request(
                ErrorCode::from_raw(ack_res.status).unwrap_or(ErrorCode::BadRequest),
            ));
        }

        info!(client = client_name, id = res.client_id, "connected to server");
        Ok(Self {
            inner: Arc::new(Inner {
                id: res.client_id,
                name: client_name.to_owned(),
                request: Mutex::new(stream),
                event_stream: Mutex::new(Some(ack)),
                control,
                own,
                segments: Mutex::new(segments),
                current_segment: AtomicI32::new(res.port_segment_index),
                ports: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(Callbacks::default()),
                fifo_prefix: PathBuf::from(from_fixed(&res.fifo_prefix)),
                closing: AtomicBool::new(false),
            }),
            thread: None,
            active: false,
        })
    }

    /// The server-assigned client id.
    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    /// This client's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The engine's sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.inner.control.sample_rate()
    }

    /// The engine's period size.
    pub fn buffer_size(&self) -> Nframes {
        self.inner.control.buffer_size()
    }

    fn request(&self, mut rec: RequestRecord) -> Result<RequestRecord, ClientError> {
        let mut stream = self.inner.request.lock().unwrap();
        write_record(&mut *stream, &rec)?;
        rec = read_record(&mut *stream)?;
        rec.result()?;
        Ok(rec)
    }

    // --- ports -------------------------------------------------------------

    /// Register a port of any builtin type.
    pub fn register_port(
        &self,
        name: &str,
        type_id: PortTypeId,
        flags: PortFlags,
    ) -> Result<Port, ClientError> {
        validate_port_name(name)?;
        let mut rec = RequestRecord::new(RequestKind::RegisterPort);
        rec.client_id = self.inner.id;
        rec.type_id = type_id as u32;
        rec.flags = flags.bits();
        rec.port_name = to_fixed(name);
        let reply = self.request(rec)?;

        let port = Port {
            id: reply.port_id,
            flags,
            type_id,
        };
        self.inner
            .ports
            .lock()
            .unwrap()
            .insert(port.id, PortState::new(flags, type_id));
        debug!(client = %self.inner.name, port = name, id = port.id, "port registered");
        Ok(port)
    }

    /// Register a mono audio port.
    pub fn register_audio_port(
        &self,
        name: &str,
        direction: PortDirection,
    ) -> Result<Port, ClientError> {
        self.register_port(name, PortTypeId::Audio, direction.flags())
    }

    /// Register a MIDI port.
    pub fn register_midi_port(
        &self,
        name: &str,
        direction: PortDirection,
    ) -> Result<Port, ClientError> {
        self.register_port(name, PortTypeId::Midi, direction.flags())
    }

    /// Release a port.
    pub fn unregister_port(&self, port: Port) -> Result<(), ClientError> {
        let mut rec = RequestRecord::new(RequestKind::UnregisterPort);
        rec.client_id = self.inner.id;
        rec.port_id = port.id;
        self.request(rec)?;
        self.inner.ports.lock().unwrap().remove(&port.id);
        Ok(())
    }

    /// Connect two ports by full name.
    pub fn connect_ports(&self, src: &str, dst: &str) -> Result<(), ClientError> {
        let mut rec = RequestRecord::new(RequestKind::ConnectPorts);
        rec.client_id = self.inner.id;
        rec.source_name = to_fixed(src);
        rec.destination_name = to_fixed(dst);
        self.request(rec)?;
        Ok(())
    }

    /// Disconnect two ports by full name.
    pub fn disconnect_ports(&self, src: &str, dst: &str) -> Result<(), ClientError> {
        let mut rec = RequestRecord::new(RequestKind::DisconnectPorts);
        rec.client_id = self.inner.id;
        rec.source_name = to_fixed(src);
        rec.destination_name = to_fixed(dst);
        self.request(rec)?;
        Ok(())
    }

    /// Find any in-use port by full name.
    pub fn port_by_name(&self, name: &str) -> Option<PortId> {
        (0..self.inner.control.port_max()).find(|&id| {
            let record = self.inner.control.read_port(id);
            record.in_use != 0 && from_fixed(&record.name) == name
        })
    }

    /// Full name of one of this client's ports.
    pub fn port_name(&self, port: &Port) -> String {
        from_fixed(&self.inner.control.read_port(port.id).name).to_owned()
    }

    /// Tie `dst` to `src`: both outputs of this client; `dst` resolves
    /// to `src`'s buffer — for us and for everyone downstream — until
    /// untied.
    pub fn tie(&self, dst: &Port, src: &Port) -> Result<(), ClientError> {
        if !dst.flags.is_output() || !src.flags.is_output() {
            return Err(ClientError::State("tying requires two output ports"));
        }
        let mut ports = self.inner.ports.lock().unwrap();
        if !ports.contains_key(&src.id) {
            return Err(ClientError::State("tying to a port of another client"));
        }
        let state = ports
            .get_mut(&dst.id)
            .ok_or(ClientError::State("tying a port of another client"))?;

        let dst_rec = self.inner.control.read_port(dst.id);
        let src_rec = self.inner.control.read_port(src.id);
        if state.own_buffer.is_none() {
            state.own_buffer = Some((dst_rec.buffer_segment, dst_rec.buffer_offset));
        }
        state.tied = Some(src.id);
        // Downstream readers resolve through the shared record, so the
        // redirect must be visible there too.
        self.inner
            .control
            .set_port_buffer(dst.id, src_rec.buffer_segment, src_rec.buffer_offset);
        Ok(())
    }

    /// Remove a tie, restoring the port's own buffer.
    pub fn untie(&self, port: &Port) -> Result<(), ClientError> {
        let mut ports = self.inner.ports.lock().unwrap();
        let state = ports
            .get_mut(&port.id)
            .ok_or(ClientError::State("untying a port of another client"))?;
        if state.tied.take().is_none() {
            return Err(ClientError::State("port is not tied"));
        }
        if let Some((segment, offset)) = state.own_buffer.take() {
            self.inner.control.set_port_buffer(port.id, segment, offset);
        }
        Ok(())
    }

    /// Publish the latency of one of this client's ports.
    pub fn set_port_latency(&self, port: &Port, frames: Nframes) {
        self.inner.control.set_port_latency(port.id, frames);
    }

    /// Ask a port's owner to monitor it (or stop).
    pub fn request_monitor(&self, port: PortId, on: bool) -> Result<(), ClientError> {
        let mut rec = RequestRecord::new(if on {
            RequestKind::RequestPortMonitor
        } else {
            RequestKind::RequestPortUnMonitor
        });
        rec.client_id = self.inner.id;
        rec.port_id = port;
        self.request(rec)?;
        Ok(())
    }

    /// Become the transport timebase client.
    pub fn set_timebase(&self) -> Result<(), ClientError> {
        let mut rec = RequestRecord::new(RequestKind::SetTimeBaseClient);
        rec.client_id = self.inner.id;
        self.request(rec)?;
        Ok(())
    }

    /// Per-client process deadline; 0 restores the server default.
    pub fn set_process_timeout_msecs(&self, msecs: u32) {
        self.inner.own.set_timeout_msecs(msecs);
    }

    // --- callbacks ---------------------------------------------------------

    /// Install the process callback. Must happen before activation.
    pub fn set_process_callback(
        &mut self,
        callback: impl FnMut(&ClientScope<'_>, Nframes) -> Result<(), ProcessFailed> + Send + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().process = Some(Box::new(callback));
    }

    /// Called when the period size changes.
    pub fn set_buffer_size_callback(&mut self, callback: impl FnMut(Nframes) + Send + 'static) {
        self.inner.callbacks.lock().unwrap().buffer_size = Some(Box::new(callback));
        self.inner.own.add_interest(EventInterest::BUFFER_SIZE);
    }

    /// Called when the sample rate changes.
    pub fn set_sample_rate_callback(&mut self, callback: impl FnMut(u32) + Send + 'static) {
        self.inner.callbacks.lock().unwrap().sample_rate = Some(Box::new(callback));
        self.inner.own.add_interest(EventInterest::SAMPLE_RATE);
    }

    /// Called when any port appears or vanishes.
    pub fn set_port_registration_callback(
        &mut self,
        callback: impl FnMut(PortId, bool) + Send + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().port_registration = Some(Box::new(callback));
        self.inner.own.add_interest(EventInterest::PORT_REGISTER);
    }

    /// Called when monitoring of an owned port is requested or dropped.
    pub fn set_port_monitor_callback(
        &mut self,
        callback: impl FnMut(PortId, bool) + Send + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().port_monitor = Some(Box::new(callback));
        self.inner.own.add_interest(EventInterest::PORT_MONITOR);
    }

    /// Called after the driver recovers from an overrun.
    pub fn set_xrun_callback(&mut self, callback: impl FnMut() + Send + 'static) {
        self.inner.callbacks.lock().unwrap().xrun = Some(Box::new(callback));
        self.inner.own.add_interest(EventInterest::XRUN);
    }

    /// Called when the server closes our event channel.
    pub fn on_shutdown(&mut self, callback: impl FnMut() + Send + 'static) {
        self.inner.callbacks.lock().unwrap().shutdown = Some(Box::new(callback));
    }

    // --- lifecycle ---------------------------------------------------------

    /// Join the execution chain. Spawns the event thread.
    pub fn activate(&mut self) -> Result<(), ClientError> {
        if self.active {
            return Ok(());
        }
        if self.thread.is_none() {
            let inner = Arc::clone(&self.inner);
            self.thread = Some(
                std::thread::Builder::new()
                    .name(format!("ruteo-client-{}", self.inner.name))
                    .spawn(move || thread::run(&inner))
                    .map_err(ClientError::Connect)?,
            );
        }
        let mut rec = RequestRecord::new(RequestKind::ActivateClient);
        rec.client_id = self.inner.id;
        self.request(rec)?;
        self.active = true;
        Ok(())
    }

    /// Leave the chain; connections are dropped, ports remain.
    pub fn deactivate(&mut self) -> Result<(), ClientError> {
        if !self.active {
            return Ok(());
        }
        let mut rec = RequestRecord::new(RequestKind::DeactivateClient);
        rec.client_id = self.inner.id;
        self.request(rec)?;
        self.active = false;
        Ok(())
    }

    /// Disconnect from the server and stop the event thread.
    pub fn close(mut self) {
        self.close_impl();
    }

    fn close_impl(&mut self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        // DropClient gets no reply; the server answers by closing our
        // sockets, which also wakes the event thread.
        let mut rec = RequestRecord::new(RequestKind::DropClient);
        rec.client_id = self.inner.id;
        if let Ok(mut stream) = self.inner.request.lock() {
            let _ = write_record(&mut *stream, &rec);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!(client = %self.inner.name, "closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close_impl();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
