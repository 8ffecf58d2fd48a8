//! The built-in dummy driver: a timer pretending to be a sound card.
//!
//! It wakes on an absolute monotonic schedule, feeds silence into its
//! capture ports and discards whatever the graph routes to its playback
//! ports. Useful for running a server with no hardware and as the
//! reference implementation of the driver contract.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use ruteo_core::port_type::PortTypeId;
use ruteo_core::shm_layout::ClientKind;
use ruteo_core::{ClientId, Nframes, PortFlags, PortId, Sample};

use crate::driver::{CycleWait, Driver, DriverError, WaitStatus};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::scope::ProcessScope;

/// How far behind schedule the pretend hardware can fall before it calls
/// the situation an xrun, in frames.
const PRETEND_BUFFER_FRAMES: u64 = 4096;

/// Construction parameters for [`DummyDriver`].
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Sample rate in frames per second.
    pub sample_rate: u32,
    /// Period size in frames.
    pub period: Nframes,
    /// Capture channels (ports feeding the graph).
    pub capture_channels: u32,
    /// Playback channels (ports draining the graph).
    pub playback_channels: u32,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            period: 1024,
            capture_channels: 2,
            playback_channels: 2,
        }
    }
}

/// Timer-driven no-hardware driver.
pub struct DummyDriver {
    cfg: DummyConfig,
    wait_time: Duration,
    next_wakeup: Option<Instant>,
    client_id: Option<ClientId>,
    capture_ports: Vec<PortId>,
    playback_ports: Vec<PortId>,
    /// Conversion scratch, one period of the wider direction.
    scratch: Vec<Sample>,
}

impl DummyDriver {
    /// Build an idle dummy driver.
    pub fn new(cfg: DummyConfig) -> Self {
        let wait_time = period_duration(cfg.period, cfg.sample_rate);
        let channels = cfg.capture_channels.max(cfg.playback_channels) as usize;
        let scratch = vec![0.0; channels * cfg.period as usize];
        Self {
            cfg,
            wait_time,
            next_wakeup: None,
            client_id: None,
            capture_ports: Vec::new(),
            playback_ports: Vec::new(),
            scratch,
        }
    }
}

fn period_duration(period: Nframes, rate: u32) -> Duration {
    Duration::from_micros(u64::from(period) * 1_000_000 / u64::from(rate.max(1)))
}

fn setup_err(code: ruteo_core::proto::ErrorCode) -> EngineError {
    EngineError::Driver(DriverError::Backend(format!("port setup failed: {code}")))
}

impl Driver for DummyDriver {
    fn attach(&mut self, engine: &Arc<Engine>) -> Result<(), EngineError> {
        engine.set_audio_params(self.cfg.sample_rate, self.cfg.period)?;
        let id = engine
            .add_in_process_client("system", ClientKind::Driver, None)
            .map_err(setup_err)?;
        self.client_id = Some(id);

        for n in 1..=self.cfg.capture_channels {
            let port = engine
                .register_port(
                    id,
                    &format!("capture_{n}"),
                    PortTypeId::Audio,
                    PortFlags::OUTPUT | PortFlags::PHYSICAL | PortFlags::TERMINAL,
                )
                .map_err(setup_err)?;
            self.capture_ports.push(port);
        }
        for n in 1..=self.cfg.playback_channels {
            let port = engine
                .register_port(
                    id,
                    &format!("playback_{n}"),
                    PortTypeId::Audio,
                    PortFlags::INPUT | PortFlags::PHYSICAL | PortFlags::TERMINAL,
                )
                .map_err(setup_err)?;
            self.playback_ports.push(port);
        }
        engine.activate(id).map_err(setup_err)?;
        debug!(
            capture = self.cfg.capture_channels,
            playback = self.cfg.playback_channels,
            "dummy driver attached"
        );
        Ok(())
    }

    fn detach(&mut self, engine: &Arc<Engine>) -> Result<(), EngineError> {
        if let Some(id) = self.client_id.take() {
            engine.remove_client(id);
        }
        self.capture_ports.clear();
        self.playback_ports.clear();
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.next_wakeup = None;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.next_wakeup = None;
        Ok(())
    }

    fn wait(&mut self) -> CycleWait {
        let now = Instant::now();
        let next = self.next_wakeup.unwrap_or(now);

        if next <= now {
            let behind = now - next;
            let pretend = period_duration(
                PRETEND_BUFFER_FRAMES as Nframes,
                self.cfg.sample_rate,
            );
            if self.next_wakeup.is_some() && behind > pretend {
                // Too late for the pretend buffer to have papered over.
                self.next_wakeup = Some(now + self.wait_time);
                return CycleWait {
                    nframes: 0,
                    status: WaitStatus::Timeout,
                    delayed_usecs: behind.as_micros() as u64,
                };
            }
            // First cycle, or late but within the buffer.
            self.next_wakeup = Some(next + self.wait_time);
            CycleWait {
                nframes: self.cfg.period,
                status: WaitStatus::Ready,
                delayed_usecs: behind.as_micros() as u64,
            }
        } else {
            std::thread::sleep(next - now);
            let delayed = Instant::now().saturating_duration_since(next);
            self.next_wakeup = Some(next + self.wait_time);
            CycleWait {
                nframes: self.cfg.period,
                status: WaitStatus::Ready,
                delayed_usecs: delayed.as_micros() as u64,
            }
        }
    }

    fn read(&mut self, scope: &ProcessScope<'_>, nframes: Nframes) -> Result<(), DriverError> {
        // No hardware: capture is silence.
        for &port in &self.capture_ports {
            scope.audio_out(port)[..nframes as usize].fill(0.0);
        }
        Ok(())
    }

    fn write(&mut self, scope: &ProcessScope<'_>, nframes: Nframes) -> Result<(), DriverError> {
        // Resolve each playback port the way hardware would, then drop
        // the frames on the floor.
        for &port in &self.playback_ports {
            let frames = scope.audio_in(port);
            self.scratch[..nframes as usize].copy_from_slice(&frames[..nframes as usize]);
        }
        Ok(())
    }

    fn null_cycle(
        &mut self,
        _scope: &ProcessScope<'_>,
        _nframes: Nframes,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    fn set_buffer_size(&mut self, nframes: Nframes) -> Result<(), DriverError> {
        self.cfg.period = nframes;
        self.wait_time = period_duration(nframes, self.cfg.sample_rate);
        let channels = self.cfg.capture_channels.max(self.cfg.playback_channels) as usize;
        self.scratch = vec![0.0; channels * nframes as usize];
        self.next_wakeup = None;
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.cfg.sample_rate
    }

    fn buffer_size(&self) -> Nframes {
        self.cfg.period
    }
}
