//! Client library for the ruteo audio routing server.
//!
//! A [`Client`] connects to a running server over its UNIX sockets,
//! attaches the shared control and buffer segments, registers typed
//! ports, wires them into the graph, and — once activated — has its
//! process callback run once per hardware period, sample-accurately
//! ordered against every other client by the server's wakeup chain.
//!
//! ```no_run
//! use ruteo_client::{Client, PortDirection};
//!
//! let mut client = Client::connect("default", "gain")?;
//! let input = client.register_audio_port("in", PortDirection::Input)?;
//! let output = client.register_audio_port("out", PortDirection::Output)?;
//! client.set_process_callback(move |scope, nframes| {
//!     let frames = scope.audio_in(&input);
//!     let out = scope.audio_out(&output);
//!     for (o, i) in out.iter_mut().zip(frames) {
//!         *o = *i * 0.5;
//!     }
//!     Ok(())
//! });
//! client.activate()?;
//! # Ok::<(), ruteo_client::ClientError>(())
//! ```
//!
//! The callback runs on the client's event thread, woken through the
//! server's FIFO chain; everything it touches must be wait-free. Events
//! (port registrations, reorders, xruns, buffer-size changes) arrive on
//! the same thread, never concurrently with the callback.

mod client;
mod control_view;
pub mod midi;
mod port;
mod thread;

pub use client::{Client, ProcessFailed};
pub use port::{ClientScope, Port, PortDirection};

use thiserror::Error;

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach the server's sockets.
    #[error("cannot contact server: {0}")]
    Connect(#[source] std::io::Error),
    /// A wire exchange failed mid-record.
    #[error(transparent)]
    Proto(#[from] ruteo_core::proto::ProtoError),
    /// The server answered a request with an error status.
    #[error("server refused request: {0}")]
    Request(#[from] ruteo_core::proto::ErrorCode),
    /// Shared-memory attach failed.
    #[error(transparent)]
    Shm(#[from] ruteo_shm::ShmError),
    /// A name failed validation before it ever reached the server.
    #[error(transparent)]
    Name(#[from] ruteo_core::name::NameError),
    /// The operation does not fit the client's current state.
    #[error("client is {0}")]
    State(&'static str),
}
