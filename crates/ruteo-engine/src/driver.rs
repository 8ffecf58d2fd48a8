//! The audio back-end contract.
//!
//! A driver owns the hardware (or a timer standing in for it), provides
//! the time source the whole graph runs on, and registers the physical
//! ports data enters and leaves through. The engine drives it from the
//! cycle thread:
//!
//! ```text
//! loop {
//!     let wait = driver.wait();            // block until the period is ready
//!     driver.read(..);                     // capture -> physical output ports
//!     /* chain walk */
//!     driver.write(..);                    // physical input ports -> playback
//! }
//! ```
//!
//! Drivers that run their own wakeup thread internally still present this
//! shape — `wait` simply parks on whatever that thread signals. The engine
//! does not care where the blocking happens.

use std::sync::Arc;

use thiserror::Error;

use ruteo_core::Nframes;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::scope::ProcessScope;

/// Outcome of one [`Driver::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// A period is ready; run the cycle.
    Ready,
    /// Spurious wakeup; wait again.
    Interrupted,
    /// The deadline was missed badly enough to need xrun recovery.
    Timeout,
    /// The back-end is gone; tear the server down.
    Fatal,
}

/// What [`Driver::wait`] returns.
#[derive(Debug, Clone, Copy)]
pub struct CycleWait {
    /// Frames available this cycle.
    pub nframes: Nframes,
    /// Disposition of the wakeup.
    pub status: WaitStatus,
    /// How late the wakeup was, for reporting.
    pub delayed_usecs: u64,
}

/// Driver-side failures.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The hardware (or its stand-in) failed.
    #[error("driver backend error: {0}")]
    Backend(String),
    /// OS-level failure inside the driver.
    #[error("driver os error: {0}")]
    Os(#[from] nix::Error),
}

/// The abstract audio back-end.
///
/// `attach` runs before the cycle thread exists and is where the driver
/// publishes its sample rate and period size and registers its physical
/// ports (as a driver-kind client). Everything else runs on the cycle
/// thread.
pub trait Driver: Send {
    /// Hook up to the engine: publish rate/period, register physical
    /// ports, activate as the driver client.
    fn attach(&mut self, engine: &Arc<Engine>) -> Result<(), EngineError>;

    /// Unregister everything `attach` created.
    fn detach(&mut self, engine: &Arc<Engine>) -> Result<(), EngineError>;

    /// Begin streaming.
    fn start(&mut self) -> Result<(), DriverError>;

    /// End streaming. Must be safe to call twice.
    fn stop(&mut self) -> Result<(), DriverError>;

    /// Block until the next period is ready.
    fn wait(&mut self) -> CycleWait;

    /// Move captured data into the physical capture ports' buffers.
    ///
    /// Memory-mapped back-ends repoint the buffers at the DMA region
    /// instead and make this a no-op.
    fn read(&mut self, scope: &ProcessScope<'_>, nframes: Nframes) -> Result<(), DriverError>;

    /// Move the physical playback ports' buffers out to the hardware.
    fn write(&mut self, scope: &ProcessScope<'_>, nframes: Nframes) -> Result<(), DriverError>;

    /// Consume one period without running the graph: silence to playback,
    /// capture discarded. Used while the graph is empty or in transition.
    fn null_cycle(&mut self, scope: &ProcessScope<'_>, nframes: Nframes)
    -> Result<(), DriverError>;

    /// Reconfigure for a new period size; may restart streaming.
    fn set_buffer_size(&mut self, nframes: Nframes) -> Result<(), DriverError>;

    /// Current sample rate in frames per second.
    fn sample_rate(&self) -> u32;

    /// Current period size in frames.
    fn buffer_size(&self) -> Nframes;

    /// One period in microseconds; the cycle runner's poll deadline.
    fn period_usecs(&self) -> u64 {
        u64::from(self.buffer_size()) * 1_000_000 / u64::from(self.sample_rate().max(1))
    }
}
