//! Driver selection for `ruteod`.
//!
//! Hardware back-ends plug in behind [`ruteo_engine::Driver`]; this
//! build carries only the timer-backed dummy.

use ruteo_engine::{Driver, DummyConfig, DummyDriver, EngineError};

use crate::Cli;

/// Instantiate the driver named on the command line.
pub fn create(cli: &Cli) -> Result<Box<dyn Driver>, EngineError> {
    match cli.driver.as_str() {
        "dummy" => Ok(Box::new(DummyDriver::new(DummyConfig {
            sample_rate: cli.rate,
            period: cli.period,
            capture_channels: cli.capture,
            playback_channels: cli.playback,
        }))),
        other => Err(EngineError::UnknownDriver(other.to_owned())),
    }
}
