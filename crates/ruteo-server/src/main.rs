//! ruteod - the ruteo audio routing daemon.

mod drivers;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ruteo_engine::{Engine, EngineConfig, EngineError};
use ruteo_shm::ShmError;

#[derive(Parser, Debug)]
#[command(
    name = "ruteod",
    version,
    about = "Low-latency audio routing server",
    long_about = None
)]
struct Cli {
    /// Audio driver backend (built in: dummy)
    #[arg(short = 'd', long = "driver")]
    driver: String,

    /// Run the cycle thread with realtime scheduling (default)
    #[arg(short = 'R', long = "realtime", overrides_with = "no_realtime")]
    realtime: bool,

    /// Disable realtime scheduling
    #[arg(short = 'r', long = "no-realtime")]
    no_realtime: bool,

    /// Realtime priority for the cycle thread
    #[arg(short = 'P', long = "realtime-priority", default_value_t = 10)]
    realtime_priority: i32,

    /// Exit once the last client disconnects
    #[arg(short = 'T', long = "temporary")]
    temporary: bool,

    /// Server name
    #[arg(short = 'n', long = "name", default_value = ruteo_core::server_dir::DEFAULT_SERVER_NAME)]
    name: String,

    /// Client process-callback timeout in milliseconds
    #[arg(short = 't', long = "timeout", default_value_t = 500)]
    timeout: u32,

    /// Maximum number of ports
    #[arg(short = 'p', long = "port-max", default_value_t = ruteo_core::DEFAULT_PORT_MAX)]
    port_max: u32,

    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Root directory for the server's sockets and FIFOs
    #[arg(long = "tmpdir")]
    tmpdir: Option<PathBuf>,

    /// Sample rate for the dummy driver
    #[arg(long = "rate", default_value_t = 48_000)]
    rate: u32,

    /// Period size in frames for the dummy driver
    #[arg(long = "period", default_value_t = 1024)]
    period: u32,

    /// Capture channels for the dummy driver
    #[arg(long = "capture", default_value_t = 2)]
    capture: u32,

    /// Playback channels for the dummy driver
    #[arg(long = "playback", default_value_t = 2)]
    playback: u32,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    // All threads inherit the blocked set; only the signal thread waits.
    let signals = shutdown_signals();
    if let Err(e) = signals.thread_block() {
        error!(error = %e, "cannot block signals");
        return ExitCode::from(1);
    }

    let cfg = EngineConfig {
        server_name: cli.name.clone(),
        tmp_root: cli.tmpdir.clone(),
        realtime: cli.realtime || !cli.no_realtime,
        rt_priority: cli.realtime_priority,
        port_max: cli.port_max,
        client_timeout_ms: cli.timeout,
        temporary: cli.temporary,
    };

    let engine = match Engine::new(cfg) {
        Ok(engine) => engine,
        Err(EngineError::Shm(ShmError::ServerExists)) => {
            error!(name = %cli.name, "server name already in use");
            return ExitCode::from(2);
        }
        Err(EngineError::Shm(e)) => {
            error!(error = %e, "cannot access shm registry");
            return ExitCode::from(3);
        }
        Err(e) => {
            error!(error = %e, "engine startup failed");
            return ExitCode::from(1);
        }
    };

    let driver = match drivers::create(&cli) {
        Ok(driver) => driver,
        Err(e) => {
            error!(error = %e, "driver setup failed");
            engine.teardown();
            return ExitCode::from(1);
        }
    };

    let handle = match engine.start(driver) {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "engine start failed");
            engine.teardown();
            return ExitCode::from(1);
        }
    };

    spawn_signal_thread(signals, Arc::clone(&engine));
    info!(name = %cli.name, driver = %cli.driver, "ruteod running");

    handle.wait();
    ExitCode::SUCCESS
}

fn shutdown_signals() -> nix::sys::signal::SigSet {
    use nix::sys::signal::{SigSet, Signal};
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGHUP);
    set.add(Signal::SIGUSR1);
    set.add(Signal::SIGUSR2);
    set
}

/// One thread sits in `sigwait`; everything it does on a fatal signal is
/// ordinary cooperative shutdown, so no async-signal-safety constraints
/// leak anywhere else.
fn spawn_signal_thread(signals: nix::sys::signal::SigSet, engine: Arc<Engine>) {
    std::thread::Builder::new()
        .name("ruteo-signals".into())
        .spawn(move || {
            loop {
                match signals.wait() {
                    Ok(sig) => {
                        info!(signal = ?sig, "shutdown signal received");
                        engine.begin_shutdown();
                        break;
                    }
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => {
                        error!(error = %e, "sigwait failed");
                        break;
                    }
                }
            }
        })
        .expect("signal thread");
}
