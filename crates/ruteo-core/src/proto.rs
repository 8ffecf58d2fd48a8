//! Wire protocol: fixed-size records over the server's UNIX sockets.
//!
//! Every exchange is a single fixed-size `#[repr(C)]` record in host byte
//! order — both ends are always the same build on the same machine, so the
//! only framing needed is the record size itself. Requests are synchronous
//! RPCs: the client writes a [`RequestRecord`], the engine writes the same
//! record back with `status` (and any result fields) filled in. Events go
//! the other way: the engine writes one [`EventRecord`] on the per-client
//! event socket and reads a single status byte as the acknowledgement.

use std::io::{Read, Write};

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::name::{CLIENT_NAME_MAX, FULL_NAME_MAX, PORT_NAME_MAX};

/// Longest path the handshake can carry (server dir + fifo prefix).
pub const PATH_BYTES: usize = 120;

/// Protocol-level failure on either side of a socket.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The socket failed or closed mid-record.
    #[error("i/o error on server socket: {0}")]
    Io(#[from] std::io::Error),
    /// A record carried an unknown discriminant.
    #[error("unrecognized wire value {0} for {1}")]
    BadTag(u32, &'static str),
}

/// Write one fixed-size record.
pub fn write_record<T: Pod, W: Write>(w: &mut W, record: &T) -> Result<(), ProtoError> {
    w.write_all(bytemuck::bytes_of(record))?;
    Ok(())
}

/// Read one fixed-size record.
pub fn read_record<T: Pod + Zeroable, R: Read>(r: &mut R) -> Result<T, ProtoError> {
    let mut record = T::zeroed();
    r.read_exact(bytemuck::bytes_of_mut(&mut record))?;
    Ok(record)
}

/// Identifies a shared-memory segment to another process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SegmentKey {
    /// POSIX shm object name, NUL padded (leading `/` included).
    pub name: [u8; 32],
    /// Segment size in bytes.
    pub size: u64,
}

impl SegmentKey {
    /// A key naming no segment.
    pub fn null() -> Self {
        Self::zeroed()
    }

    /// True when the key names a segment.
    pub fn is_set(&self) -> bool {
        self.name[0] != 0
    }
}

// --- request channel -------------------------------------------------------

/// Request discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestKind {
    /// Register a port; replies with the new port id.
    RegisterPort = 0,
    /// Release a port slot.
    UnregisterPort = 1,
    /// Connect two ports by full name.
    ConnectPorts = 2,
    /// Disconnect two ports by full name.
    DisconnectPorts = 3,
    /// Enter the execution chain.
    ActivateClient = 4,
    /// Leave the chain, dropping all connections.
    DeactivateClient = 5,
    /// Ask a port's owner to start monitoring it.
    RequestPortMonitor = 6,
    /// Withdraw a monitor request.
    RequestPortUnMonitor = 7,
    /// Make a client the transport timebase.
    SetTimeBaseClient = 8,
    /// Remove a client entirely; no reply is sent.
    DropClient = 9,
}

impl RequestKind {
    /// Decode a wire value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::RegisterPort),
            1 => Some(Self::UnregisterPort),
            2 => Some(Self::ConnectPorts),
            3 => Some(Self::DisconnectPorts),
            4 => Some(Self::ActivateClient),
            5 => Some(Self::DeactivateClient),
            6 => Some(Self::RequestPortMonitor),
            7 => Some(Self::RequestPortUnMonitor),
            8 => Some(Self::SetTimeBaseClient),
            9 => Some(Self::DropClient),
            _ => None,
        }
    }
}

/// Inline request failure codes (`RequestRecord::status`).
///
/// These never kill the requesting client; they are the "user error" and
/// "resource exhaustion" classes of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(i32)]
pub enum ErrorCode {
    /// Catch-all for malformed requests.
    #[error("malformed request")]
    BadRequest = 1,
    /// Named port does not exist.
    #[error("no such port")]
    UnknownPort = 2,
    /// Client id does not exist.
    #[error("no such client")]
    UnknownClient = 3,
    /// Name failed validation.
    #[error("invalid name")]
    BadName = 4,
    /// Another port already carries the name.
    #[error("name already in use")]
    NameInUse = 5,
    /// Source is not an output or destination is not an input.
    #[error("port has the wrong direction")]
    WrongDirection = 6,
    /// Endpoint types differ.
    #[error("port types do not match")]
    TypeMismatch = 7,
    /// The connection would close a feedback loop.
    #[error("connection would create a cycle")]
    WouldCycle = 8,
    /// Destination already connected and its type cannot mix.
    #[error("port type does not support multiple connections")]
    NoMixdown = 9,
    /// The two ports are not connected.
    #[error("ports are not connected")]
    NotConnected = 10,
    /// Port table is full.
    #[error("no free port slot")]
    NoPortSlot = 11,
    /// Buffer pool is exhausted.
    #[error("no free port buffer")]
    NoBuffer = 12,
    /// The request kind is recognized but not served on this channel.
    #[error("request not supported")]
    Unsupported = 13,
}

impl ErrorCode {
    /// Decode a non-zero wire status.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::BadRequest),
            2 => Some(Self::UnknownPort),
            3 => Some(Self::UnknownClient),
            4 => Some(Self::BadName),
            5 => Some(Self::NameInUse),
            6 => Some(Self::WrongDirection),
            7 => Some(Self::TypeMismatch),
            8 => Some(Self::WouldCycle),
            9 => Some(Self::NoMixdown),
            10 => Some(Self::NotConnected),
            11 => Some(Self::NoPortSlot),
            12 => Some(Self::NoBuffer),
            13 => Some(Self::Unsupported),
            _ => None,
        }
    }
}

/// The request/reply record. One shape serves every [`RequestKind`]; the
/// engine echoes it back with `status` and result fields filled in.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct RequestRecord {
    /// [`RequestKind`] as raw u32.
    pub kind: u32,
    /// 0 on success, else an [`ErrorCode`].
    pub status: i32,
    /// Requesting (or targeted) client.
    pub client_id: u32,
    /// Port argument / register result.
    pub port_id: u32,
    /// [`crate::PortFlags`] bits for RegisterPort.
    pub flags: u32,
    /// Port type for RegisterPort.
    pub type_id: u32,
    /// Port short name for RegisterPort.
    pub port_name: [u8; PORT_NAME_MAX],
    /// Source full name for (dis)connect.
    pub source_name: [u8; FULL_NAME_MAX],
    /// Destination full name for (dis)connect.
    pub destination_name: [u8; FULL_NAME_MAX],
}

impl RequestRecord {
    /// A zeroed record with the kind set.
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind: kind as u32,
            ..Self::zeroed()
        }
    }

    /// The reply's status as a result.
    pub fn result(&self) -> Result<(), ErrorCode> {
        match self.status {
            0 => Ok(()),
            raw => Err(ErrorCode::from_raw(raw).unwrap_or(ErrorCode::BadRequest)),
        }
    }
}

// --- event channel ---------------------------------------------------------

/// Event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    /// A port appeared (`a` = port id).
    PortRegistered = 0,
    /// A port vanished (`a` = port id).
    PortUnregistered = 1,
    /// A connection involving one of your ports was made
    /// (`a` = your port, `b` = the other port).
    PortConnected = 2,
    /// A connection involving one of your ports was dropped.
    PortDisconnected = 3,
    /// Your position in the chain changed (`a` = new rank); reopen
    /// `fifo-<rank>` for reading and `fifo-<rank+1>` for writing.
    GraphReordered = 4,
    /// The period size changed (`a` = nframes).
    BufferSizeChange = 5,
    /// The sample rate changed (`a` = frames per second).
    SampleRateChange = 6,
    /// Someone asked you to monitor port `a`.
    PortMonitor = 7,
    /// The last monitor request for port `a` was withdrawn.
    PortUnMonitor = 8,
    /// A new port-buffer segment exists; attach `segment`.
    NewPortBufferSegment = 9,
    /// The driver missed its deadline and was restarted.
    XRun = 10,
}

impl EventKind {
    /// Decode a wire value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::PortRegistered),
            1 => Some(Self::PortUnregistered),
            2 => Some(Self::PortConnected),
            3 => Some(Self::PortDisconnected),
            4 => Some(Self::GraphReordered),
            5 => Some(Self::BufferSizeChange),
            6 => Some(Self::SampleRateChange),
            7 => Some(Self::PortMonitor),
            8 => Some(Self::PortUnMonitor),
            9 => Some(Self::NewPortBufferSegment),
            10 => Some(Self::XRun),
            _ => None,
        }
    }
}

/// One event as written to a client's event socket.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct EventRecord {
    /// [`EventKind`] as raw u32.
    pub kind: u32,
    /// First payload word; meaning depends on the kind.
    pub a: u32,
    /// Second payload word.
    pub b: u32,
    /// Keeps `segment` aligned; always zero.
    pub reserved: u32,
    /// Segment payload for [`EventKind::NewPortBufferSegment`].
    pub segment: SegmentKey,
}

impl EventRecord {
    /// An event with word payloads only.
    pub fn new(kind: EventKind, a: u32, b: u32) -> Self {
        Self {
            kind: kind as u32,
            a,
            b,
            ..Self::zeroed()
        }
    }
}

// --- handshake -------------------------------------------------------------

/// First record on a fresh connection to the request socket.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ClientConnectRequest {
    /// [`crate::ClientKind`] as raw u32.
    pub kind: u32,
    /// Process id of the connecting client.
    pub pid: i32,
    /// Desired client name, NUL padded.
    pub name: [u8; CLIENT_NAME_MAX],
    /// Load path for in-process clients; unused otherwise.
    pub load_path: [u8; PATH_BYTES],
}

/// The engine's answer to a [`ClientConnectRequest`].
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ClientConnectResult {
    /// 0 on success, else an [`ErrorCode`].
    pub status: i32,
    /// Assigned client id.
    pub client_id: u32,
    /// Non-zero when the server runs realtime.
    pub realtime: u32,
    /// Priority the client should use for its process thread.
    pub rt_priority: i32,
    /// Pool index of the current port-buffer segment.
    pub port_segment_index: i32,
    /// Keeps the keys aligned; always zero.
    pub reserved: u32,
    /// The client's own control-block segment.
    pub client_key: SegmentKey,
    /// The engine control segment.
    pub control_key: SegmentKey,
    /// The current port-buffer segment.
    pub port_segment_key: SegmentKey,
    /// Path prefix of the wakeup FIFOs (`<prefix>-<n>`).
    pub fifo_prefix: [u8; PATH_BYTES],
}

/// First record on a fresh connection to the ack socket.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct AckRequest {
    /// The id handed out on the request socket.
    pub client_id: u32,
}

/// Completes the handshake; the ack connection becomes the event channel.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct AckResult {
    /// 0 on success.
    pub status: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_roundtrip_through_byte_streams() {
        let mut req = RequestRecord::new(RequestKind::ConnectPorts);
        req.client_id = 7;
        req.source_name = crate::name::to_fixed("a:out");
        req.destination_name = crate::name::to_fixed("b:in");

        let mut wire = Vec::new();
        write_record(&mut wire, &req).unwrap();
        assert_eq!(wire.len(), size_of::<RequestRecord>());

        let back: RequestRecord = read_record(&mut wire.as_slice()).unwrap();
        assert_eq!(back.kind, RequestKind::ConnectPorts as u32);
        assert_eq!(crate::name::from_fixed(&back.source_name), "a:out");
        assert_eq!(crate::name::from_fixed(&back.destination_name), "b:in");
    }

    #[test]
    fn short_reads_error_out() {
        let wire = vec![0u8; size_of::<EventRecord>() - 1];
        let err = read_record::<EventRecord, _>(&mut wire.as_slice()).unwrap_err();
        assert!(matches!(err, ProtoError::Io(_)));
    }

    #[test]
    fn every_status_code_roundtrips() {
        for raw in 1..=13 {
            let code = ErrorCode::from_raw(raw).unwrap();
            assert_eq!(code as i32, raw);
        }
        assert!(ErrorCode::from_raw(0).is_none());
        assert!(ErrorCode::from_raw(99).is_none());
    }

    #[test]
    fn reply_status_maps_to_result() {
        let mut rec = RequestRecord::new(RequestKind::RegisterPort);
        assert!(rec.result().is_ok());
        rec.status = ErrorCode::NoPortSlot as i32;
        assert_eq!(rec.result(), Err(ErrorCode::NoPortSlot));
    }
}
