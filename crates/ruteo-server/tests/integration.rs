//! End-to-end scenarios: a real engine, real external clients.
//!
//! Clients here are genuine protocol clients — they handshake over the
//! server's sockets, attach the shared segments, and are woken through
//! the FIFO chain — they just happen to live on threads of the test
//! process instead of in separate processes. The driver is scripted:
//! each test commands cycles explicitly and observes what reaches the
//! driver's playback port.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ruteo_client::{Client, PortDirection};
use ruteo_core::port_type::PortTypeId;
use ruteo_core::shm_layout::ClientKind;
use ruteo_core::{ClientId, Nframes, PortFlags, PortId, Sample};
use ruteo_engine::scope::ProcessScope;
use ruteo_engine::{
    CycleWait, Driver, DriverError, Engine, EngineConfig, EngineError, EngineHandle, WaitStatus,
};

const RATE: u32 = 48_000;
const PERIOD: Nframes = 1024;

enum Cmd {
    Cycle,
    Xrun,
}

struct ScriptDriver {
    id: Option<ClientId>,
    capture: Option<PortId>,
    playback: Option<PortId>,
    cmds: Receiver<Cmd>,
    observed: Sender<Vec<Sample>>,
}

impl Driver for ScriptDriver {
    fn attach(&mut self, engine: &Arc<Engine>) -> Result<(), EngineError> {
        engine.set_audio_params(RATE, PERIOD)?;
        let id = engine
            .add_in_process_client("system", ClientKind::Driver, None)
            .expect("driver client");
        self.id = Some(id);
        self.capture = Some(
            engine
                .register_port(
                    id,
                    "capture_1",
                    PortTypeId::Audio,
                    PortFlags::OUTPUT | PortFlags::PHYSICAL | PortFlags::TERMINAL,
                )
                .expect("capture port"),
        );
        self.playback = Some(
            engine
                .register_port(
                    id,
                    "playback_1",
                    PortTypeId::Audio,
                    PortFlags::INPUT | PortFlags::PHYSICAL | PortFlags::TERMINAL,
                )
                .expect("playback port"),
        );
        engine.activate(id).expect("driver activate");
        Ok(())
    }

    fn detach(&mut self, engine: &Arc<Engine>) -> Result<(), EngineError> {
        if let Some(id) = self.id.take() {
            engine.remove_client(id);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn wait(&mut self) -> CycleWait {
        match self.cmds.recv_timeout(Duration::from_millis(25)) {
            Ok(Cmd::Cycle) => CycleWait {
                nframes: PERIOD,
                status: WaitStatus::Ready,
                delayed_usecs: 0,
            },
            Ok(Cmd::Xrun) => CycleWait {
                nframes: 0,
                status: WaitStatus::Timeout,
                delayed_usecs: 40_000,
            },
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => CycleWait {
                nframes: 0,
                status: WaitStatus::Interrupted,
                delayed_usecs: 0,
            },
        }
    }

    fn read(&mut self, scope: &ProcessScope<'_>, nframes: Nframes) -> Result<(), DriverError> {
        if let Some(p) = self.capture {
            scope.audio_out(p)[..nframes as usize].fill(0.0);
        }
        Ok(())
    }

    fn write(&mut self, scope: &ProcessScope<'_>, _nframes: Nframes) -> Result<(), DriverError> {
        if let Some(p) = self.playback {
            let _ = self.observed.send(scope.audio_in(p).to_vec());
        }
        Ok(())
    }

    fn null_cycle(
        &mut self,
        _scope: &ProcessScope<'_>,
        _nframes: Nframes,
    ) -> Result<(), DriverError> {
        let _ = self.observed.send(vec![0.0; PERIOD as usize]);
        Ok(())
    }

    fn set_buffer_size(&mut self, _nframes: Nframes) -> Result<(), DriverError> {
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        RATE
    }

    fn buffer_size(&self) -> Nframes {
        PERIOD
    }
}

struct Rig {
    handle: EngineHandle,
    cmds: Sender<Cmd>,
    observed: Receiver<Vec<Sample>>,
    server_name: String,
    tmp: tempfile::TempDir,
}

static NEXT_RIG: AtomicU32 = AtomicU32::new(0);

fn rig(tag: &str, client_timeout_ms: u32, temporary: bool) -> Rig {
    let tmp = tempfile::tempdir().unwrap();
    let n = NEXT_RIG.fetch_add(1, Ordering::SeqCst);
    let server_name = format!("e2e-{tag}-{}-{n}", std::process::id());
    let cfg = EngineConfig {
        server_name: server_name.clone(),
        tmp_root: Some(tmp.path().to_path_buf()),
        realtime: false,
        rt_priority: 10,
        port_max: 32,
        client_timeout_ms,
        temporary,
    };
    let engine = Engine::new(cfg).unwrap();

    let (cmd_tx, cmd_rx) = channel();
    let (obs_tx, obs_rx) = channel();
    let driver = Box::new(ScriptDriver {
        id: None,
        capture: None,
        playback: None,
        cmds: cmd_rx,
        observed: obs_tx,
    });
    let handle = engine.start(driver).unwrap();
    Rig {
        handle,
        cmds: cmd_tx,
        observed: obs_rx,
        server_name,
        tmp,
    }
}

impl Rig {
    fn engine(&self) -> &Arc<Engine> {
        self.handle.engine()
    }

    fn client(&self, name: &str) -> Client {
        Client::connect_with_root(Some(self.tmp.path()), &self.server_name, name).unwrap()
    }

    fn cycle(&self) -> Vec<Sample> {
        self.cmds.send(Cmd::Cycle).unwrap();
        self.observed
            .recv_timeout(Duration::from_secs(5))
            .expect("cycle produced no playback period")
    }
}

fn all_near(frames: &[Sample], expect: f32) -> bool {
    frames.iter().all(|&s| (s - expect).abs() < 1e-6)
}

#[test]
fn external_client_passes_silence_through() {
    let rig = rig("silence", 500, false);
    let mut c1 = rig.client("c1");
    let input = c1.register_audio_port("in", PortDirection::Input).unwrap();
    let output = c1.register_audio_port("out", PortDirection::Output).unwrap();
    c1.set_process_callback(move |scope, nframes| {
        let frames = scope.audio_in(&input);
        scope.audio_out(&output)[..nframes as usize].copy_from_slice(&frames[..nframes as usize]);
        Ok(())
    });
    c1.activate().unwrap();
    c1.connect_ports("system:capture_1", "c1:in").unwrap();
    c1.connect_ports("c1:out", "system:playback_1").unwrap();

    for _ in 0..10 {
        let frames = rig.cycle();
        assert_eq!(frames.len(), PERIOD as usize);
        assert!(all_near(&frames, 0.0), "non-silent frame observed");
    }
    drop(c1);
    rig.handle.shutdown();
}

#[test]
fn three_client_subgraph_mixes_fan_in() {
    let rig = rig("fanin", 500, false);

    let mut producers = Vec::new();
    for (name, value) in [("c1", 0.25f32), ("c2", 0.5f32)] {
        let mut c = rig.client(name);
        let out = c.register_audio_port("out", PortDirection::Output).unwrap();
        c.set_process_callback(move |scope, nframes| {
            scope.audio_out(&out)[..nframes as usize].fill(value);
            Ok(())
        });
        c.activate().unwrap();
        producers.push(c);
    }

    let mut c3 = rig.client("c3");
    let input = c3.register_audio_port("in", PortDirection::Input).unwrap();
    let output = c3.register_audio_port("out", PortDirection::Output).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);
    c3.set_process_callback(move |scope, nframes| {
        let frames = scope.audio_in(&input);
        seen_in.lock().unwrap().push(frames[0]);
        scope.audio_out(&output)[..nframes as usize].copy_from_slice(&frames[..nframes as usize]);
        Ok(())
    });
    c3.activate().unwrap();

    c3.connect_ports("c1:out", "c3:in").unwrap();
    c3.connect_ports("c2:out", "c3:in").unwrap();
    c3.connect_ports("c3:out", "system:playback_1").unwrap();

    for _ in 0..4 {
        let frames = rig.cycle();
        assert!(
            all_near(&frames, 0.75),
            "expected mixed 0.75, got {:?}",
            &frames[..4]
        );
    }
    assert!(seen.lock().unwrap().iter().all(|&s| (s - 0.75).abs() < 1e-6));

    drop(producers);
    drop(c3);
    rig.handle.shutdown();
}

#[test]
fn reorder_event_rethreads_the_chain() {
    let rig = rig("reorder", 500, false);

    let copy_input = Arc::new(AtomicBool::new(false));
    let mut c1 = rig.client("c1");
    let c1_in = c1.register_audio_port("in", PortDirection::Input).unwrap();
    let c1_out = c1.register_audio_port("out", PortDirection::Output).unwrap();
    let flag = Arc::clone(&copy_input);
    c1.set_process_callback(move |scope, nframes| {
        if flag.load(Ordering::SeqCst) {
            let frames = scope.audio_in(&c1_in);
            scope.audio_out(&c1_out)[..nframes as usize]
                .copy_from_slice(&frames[..nframes as usize]);
        } else {
            scope.audio_out(&c1_out)[..nframes as usize].fill(0.1);
        }
        Ok(())
    });
    c1.activate().unwrap();

    let mut c2 = rig.client("c2");
    let c2_out = c2.register_audio_port("out", PortDirection::Output).unwrap();
    c2.set_process_callback(move |scope, nframes| {
        scope.audio_out(&c2_out)[..nframes as usize].fill(0.9);
        Ok(())
    });
    c2.activate().unwrap();

    c1.connect_ports("c1:out", "system:playback_1").unwrap();
    for _ in 0..5 {
        assert!(all_near(&rig.cycle(), 0.1));
    }

    // c2 now feeds c1; the chain must run c2 first from the next cycle
    // the new order applies to.
    c1.connect_ports("c2:out", "c1:in").unwrap();
    copy_input.store(true, Ordering::SeqCst);

    let frames = rig.cycle();
    assert!(
        all_near(&frames, 0.9),
        "expected the feeder's value, got {:?}",
        &frames[..4]
    );

    drop(c1);
    drop(c2);
    rig.handle.shutdown();
}

#[test]
fn hung_client_is_removed_and_peers_learn() {
    let rig = rig("death", 50, false);

    let unregistered: Arc<Mutex<Vec<PortId>>> = Arc::new(Mutex::new(Vec::new()));
    let mut good = rig.client("good");
    let good_out = good.register_audio_port("out", PortDirection::Output).unwrap();
    let sink = Arc::clone(&unregistered);
    good.set_port_registration_callback(move |port, registered| {
        if !registered {
            sink.lock().unwrap().push(port);
        }
    });
    good.set_process_callback(move |scope, nframes| {
        scope.audio_out(&good_out)[..nframes as usize].fill(0.25);
        Ok(())
    });
    good.activate().unwrap();
    good.connect_ports("good:out", "system:playback_1").unwrap();

    // The doomed client blocks inside its callback until released,
    // standing in for a SIGKILLed process: it reads its wakeup byte and
    // never completes.
    let (release_tx, release_rx) = channel::<()>();
    let mut bad = rig.client("bad");
    let bad_out = bad.register_audio_port("out", PortDirection::Output).unwrap();
    bad.set_process_callback(move |_scope, _nframes| {
        let _ = release_rx.recv();
        Ok(())
    });
    bad.activate().unwrap();
    let bad_port = bad_out.id();

    let engine = Arc::clone(rig.engine());
    assert!(engine.port_by_name("bad:out").is_some());

    // One cycle times out on the hung subgraph; the engine then removes
    // the hung client and later cycles run clean.
    rig.cycle();
    for _ in 0..3 {
        let frames = rig.cycle();
        assert!(all_near(&frames, 0.25), "survivor stopped producing");
    }
    assert!(engine.port_by_name("bad:out").is_none(), "hung client still present");
    assert!(
        unregistered.lock().unwrap().contains(&bad_port),
        "peer was not told about the unregistered port"
    );

    release_tx.send(()).ok();
    drop(bad);
    drop(good);
    rig.handle.shutdown();
}

#[test]
fn connection_loop_is_refused_over_the_wire() {
    let rig = rig("loop", 500, false);

    let mut c1 = rig.client("c1");
    c1.register_audio_port("in", PortDirection::Input).unwrap();
    c1.register_audio_port("out", PortDirection::Output).unwrap();
    let mut c2 = rig.client("c2");
    c2.register_audio_port("in", PortDirection::Input).unwrap();
    c2.register_audio_port("out", PortDirection::Output).unwrap();
    c1.activate().unwrap();
    c2.activate().unwrap();

    c1.connect_ports("c1:out", "c2:in").unwrap();
    let err = c1.connect_ports("c2:out", "c1:in").unwrap_err();
    assert!(matches!(
        err,
        ruteo_client::ClientError::Request(ruteo_core::proto::ErrorCode::WouldCycle)
    ));

    let engine = rig.engine();
    let c1_out = engine.port_by_name("c1:out").unwrap();
    let c2_in = engine.port_by_name("c2:in").unwrap();
    let c2_out = engine.port_by_name("c2:out").unwrap();
    assert_eq!(engine.port_connections(c1_out), vec![c2_in]);
    assert!(engine.port_connections(c2_out).is_empty());

    drop(c1);
    drop(c2);
    rig.handle.shutdown();
}

#[test]
fn xrun_reaches_external_clients() {
    let rig = rig("xrun", 500, false);

    let xruns = Arc::new(AtomicU32::new(0));
    let mut c1 = rig.client("c1");
    let out = c1.register_audio_port("out", PortDirection::Output).unwrap();
    let counter = Arc::clone(&xruns);
    c1.set_xrun_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    c1.set_process_callback(move |scope, nframes| {
        scope.audio_out(&out)[..nframes as usize].fill(0.5);
        Ok(())
    });
    c1.activate().unwrap();
    c1.connect_ports("c1:out", "system:playback_1").unwrap();

    rig.cycle();
    rig.cmds.send(Cmd::Xrun).unwrap();
    let frames = rig.cycle();
    assert!(all_near(&frames, 0.5), "cycle after xrun is wrong");
    assert!(xruns.load(Ordering::SeqCst) >= 1, "xrun callback not invoked");

    drop(c1);
    rig.handle.shutdown();
}

#[test]
fn single_connection_is_zero_copy_and_none_is_silence() {
    let rig = rig("zerocopy", 500, false);

    let mut c1 = rig.client("c1");
    let input = c1.register_audio_port("in", PortDirection::Input).unwrap();
    let output = c1.register_audio_port("out", PortDirection::Output).unwrap();
    let silent = c1.register_audio_port("quiet", PortDirection::Input).unwrap();

    let zero_copy = Arc::new(AtomicBool::new(false));
    let silence_ok = Arc::new(AtomicBool::new(false));
    let (zc, so) = (Arc::clone(&zero_copy), Arc::clone(&silence_ok));
    c1.set_process_callback(move |scope, nframes| {
        let out_ptr = {
            let out = scope.audio_out(&output);
            out[..nframes as usize].fill(0.6);
            out.as_ptr()
        };
        // One connection from our own output: the resolved input must be
        // the very same buffer.
        let inp = scope.audio_in(&input);
        zc.store(std::ptr::eq(inp.as_ptr(), out_ptr), Ordering::SeqCst);
        // No connections: the shared silence buffer.
        let quiet = scope.audio_in(&silent);
        so.store(quiet.iter().all(|&s| s == 0.0), Ordering::SeqCst);
        Ok(())
    });
    c1.activate().unwrap();
    // A client looping onto itself reads its previous period.
    c1.connect_ports("c1:out", "c1:in").unwrap();

    rig.cycle();
    rig.cycle();
    assert!(zero_copy.load(Ordering::SeqCst), "input was not zero-copy");
    assert!(silence_ok.load(Ordering::SeqCst), "silence buffer was not silent");

    drop(c1);
    rig.handle.shutdown();
}

#[test]
fn tied_output_borrows_the_other_buffer() {
    let rig = rig("tie", 500, false);

    let mut c1 = rig.client("c1");
    let main = c1.register_audio_port("main", PortDirection::Output).unwrap();
    let aux = c1.register_audio_port("aux", PortDirection::Output).unwrap();
    c1.tie(&aux, &main).unwrap();
    c1.set_process_callback(move |scope, nframes| {
        scope.audio_out(&main)[..nframes as usize].fill(0.33);
        Ok(())
    });
    c1.activate().unwrap();
    // Route the tied port: the driver must see what was written to main.
    c1.connect_ports("c1:aux", "system:playback_1").unwrap();

    rig.cycle();
    let frames = rig.cycle();
    assert!(all_near(&frames, 0.33), "tied output did not alias");

    drop(c1);
    rig.handle.shutdown();
}

#[test]
fn midi_events_cross_the_graph_in_order() {
    let rig = rig("midi", 500, false);

    let mut producer = rig.client("prod");
    let midi_out = producer.register_midi_port("out", PortDirection::Output).unwrap();
    producer.set_process_callback(move |scope, _nframes| {
        let mut out = scope.midi_out(&midi_out);
        out.clear();
        out.write(5, &[0x90, 60, 100]).unwrap();
        out.write(10, &[0x80, 60, 0]).unwrap();
        Ok(())
    });
    producer.activate().unwrap();

    let received: Arc<Mutex<Vec<(u32, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut consumer = rig.client("cons");
    let midi_in = consumer.register_midi_port("in", PortDirection::Input).unwrap();
    let sink = Arc::clone(&received);
    consumer.set_process_callback(move |scope, _nframes| {
        let input = scope.midi_in(&midi_in);
        let mut sink = sink.lock().unwrap();
        sink.clear();
        for ev in input.iter() {
            sink.push((ev.time, ev.data.to_vec()));
        }
        Ok(())
    });
    consumer.activate().unwrap();
    consumer.connect_ports("prod:out", "cons:in").unwrap();

    rig.cycle();
    rig.cycle();
    let events = received.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![(5, vec![0x90, 60, 100]), (10, vec![0x80, 60, 0])]
    );

    drop(producer);
    drop(consumer);
    rig.handle.shutdown();
}

#[test]
fn monitor_requests_reach_the_owner_on_transitions() {
    let rig = rig("monitor", 500, false);

    let seen: Arc<Mutex<Vec<(PortId, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut owner = rig.client("owner");
    let port = owner
        .register_port(
            "mon",
            PortTypeId::Audio,
            PortFlags::OUTPUT | PortFlags::CAN_MONITOR,
        )
        .unwrap();
    let sink = Arc::clone(&seen);
    owner.set_port_monitor_callback(move |port, on| {
        sink.lock().unwrap().push((port, on));
    });
    owner.activate().unwrap();

    let watcher = rig.client("watcher");
    watcher.request_monitor(port.id(), true).unwrap();
    watcher.request_monitor(port.id(), true).unwrap();
    watcher.request_monitor(port.id(), false).unwrap();
    watcher.request_monitor(port.id(), false).unwrap();

    let events = seen.lock().unwrap().clone();
    assert_eq!(events, vec![(port.id(), true), (port.id(), false)]);

    drop(owner);
    drop(watcher);
    rig.handle.shutdown();
}

#[test]
fn temporary_server_exits_with_its_last_client() {
    let rig = rig("temporary", 500, true);

    let c1 = rig.client("c1");
    assert!(rig.engine().is_running());
    c1.close();

    // Removal happens on the server thread; give it a few polls.
    let engine = Arc::clone(rig.engine());
    for _ in 0..100 {
        if !engine.is_running() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!engine.is_running(), "temporary server kept running");
    rig.handle.wait();
}

#[test]
fn duplicate_client_names_are_refused() {
    let rig = rig("dupname", 500, false);
    let _c1 = rig.client("same");
    let err = Client::connect_with_root(Some(rig.tmp.path()), &rig.server_name, "same");
    assert!(matches!(
        err,
        Err(ruteo_client::ClientError::Request(
            ruteo_core::proto::ErrorCode::NameInUse
        ))
    ));
    rig.handle.shutdown();
}

#[test]
fn port_type_mismatch_is_refused() {
    let rig = rig("typemismatch", 500, false);
    let c1 = rig.client("c1");
    c1.register_midi_port("m", PortDirection::Output).unwrap();
    let err = c1.connect_ports("c1:m", "system:playback_1").unwrap_err();
    assert!(matches!(
        err,
        ruteo_client::ClientError::Request(ruteo_core::proto::ErrorCode::TypeMismatch)
    ));
    drop(c1);
    rig.handle.shutdown();
}
