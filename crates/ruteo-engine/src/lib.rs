//! The ruteo server engine.
//!
//! One [`Engine`] value owns the whole server: the shared control
//! segment, the port table and buffer pool, the client registry, the
//! connection graph and its compiled chain, the wakeup FIFOs, and the
//! IPC surface. `ruteod` builds exactly one, attaches a [`Driver`], and
//! the engine's two threads (server + cycle) do the rest.
//!
//! The crate also hosts the driver contract and the built-in
//! [`DummyDriver`], plus the [`InProcessClient`] trait for clients that
//! run inside the server process.

mod buffers;
pub mod client;
mod control;
mod cycle;
pub mod driver;
pub mod dummy;
pub mod engine;
pub mod error;
mod fifo;
mod graph;
pub mod scope;
mod server;

pub use client::{InProcessClient, ProcessFailed};
pub use driver::{CycleWait, Driver, DriverError, WaitStatus};
pub use dummy::{DummyConfig, DummyDriver};
pub use engine::{Engine, EngineConfig, EngineHandle};
pub use error::EngineError;
pub use scope::ProcessScope;
