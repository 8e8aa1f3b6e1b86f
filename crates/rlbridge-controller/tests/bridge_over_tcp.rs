//! Bridges driven by real peers over loopback TCP.

use std::thread;
use std::time::{Duration, Instant};

use rlbridge_controller::{MultiEnvBridge, SingleEnvBridge};
use rlbridge_core::{BridgeConfig, BridgeMode, EnvId, Terminator, TickReport};
use rlbridge_net::{MultiPool, SinglePool};
use rlbridge_test_utils::{RecordingEnvironment, TestPeer};
use rlbridge_wire::{Handshake, StateMessage};

const WAIT: Duration = Duration::from_secs(3);
const POLL: Duration = Duration::from_millis(5);

fn config(num_envs: usize) -> BridgeConfig {
    BridgeConfig {
        port: 0,
        num_envs,
        observation_size: 2,
        action_size: 2,
        accept_poll_ms: 5,
        ..BridgeConfig::default()
    }
}

/// Tick until `done` holds for the accumulated reports.
fn tick_until(
    mut tick: impl FnMut() -> TickReport,
    mut done: impl FnMut(&[TickReport]) -> bool,
) -> Vec<TickReport> {
    let deadline = Instant::now() + WAIT;
    let mut reports = Vec::new();
    loop {
        let report = tick();
        if !report.is_empty() {
            reports.push(report);
        }
        if done(&reports) {
            return reports;
        }
        assert!(Instant::now() < deadline, "bridge made no progress: {reports:?}");
        thread::sleep(POLL);
    }
}

fn sent_count(reports: &[TickReport]) -> usize {
    reports.iter().map(|r| r.sent.len()).sum()
}

#[test]
fn single_bridge_round_trip() {
    let config = config(1);
    let mut pool = SinglePool::new(&config);
    let addr = pool.start().unwrap();

    let mut admin = TestPeer::connect(addr, &config.terminator).unwrap();
    let handshake = Handshake::parse(&admin.recv().unwrap()).unwrap();
    assert_eq!(handshake, Handshake::single(2, 2));
    let mut peer = TestPeer::connect(addr, &config.terminator).unwrap();
    assert!(pool.wait_until_connected(WAIT, POLL));

    let env = RecordingEnvironment::new("0.50,1.50").with_reward(2.0, true);
    let probe = env.probe();
    let mut bridge = SingleEnvBridge::new(&config, Box::new(pool), Box::new(env));
    bridge.start_training();

    peer.send("RESET").unwrap();
    tick_until(|| bridge.tick(), |r| sent_count(r) == 1);
    assert_eq!(peer.recv().unwrap(), "OBS=0.50,1.50;REW=0.00;DONE=0");

    peer.send("ACT=0.1,-0.1").unwrap();
    tick_until(|| bridge.tick(), |r| sent_count(r) == 1);
    let reply = StateMessage::parse(&peer.recv().unwrap()).unwrap();
    assert_eq!(reply.state, "0.50,1.50");
    assert!(reply.done);
    assert_eq!(probe.actions(), ["0.1,-0.1"]);

    peer.send("TRAINING_COMPLETE").unwrap();
    tick_until(|| bridge.tick(), |r| r.iter().any(|r| r.completed));
    assert_eq!(bridge.mode(), BridgeMode::Stopped);
    assert!(peer.is_closed_by_server(WAIT));
    assert!(admin.is_closed_by_server(WAIT));
}

#[test]
fn multi_bridge_routes_by_slot() {
    let config = BridgeConfig {
        terminator: Terminator::Token("STEP".into()),
        send_observation_on_reset: false,
        ..config(2)
    };
    let mut pool = MultiPool::new(&config);
    let addr = pool.start().unwrap();

    let mut admin = TestPeer::connect(addr, &config.terminator).unwrap();
    assert_eq!(
        admin.recv().unwrap(),
        "CONFIG:OBS=2;ACT=2;ENV_TYPE=MULTI;ENV_COUNT=2"
    );
    let mut first = TestPeer::connect(addr, &config.terminator).unwrap();
    // Slots fill in acceptance order.
    let deadline = Instant::now() + WAIT;
    while pool.connected_envs() < 1 {
        assert!(Instant::now() < deadline);
        thread::sleep(POLL);
    }
    let mut second = TestPeer::connect(addr, &config.terminator).unwrap();
    assert!(pool.wait_until_connected(WAIT, POLL));

    let envs = vec![
        RecordingEnvironment::new("1.00,1.00").with_reward(0.25, false),
        RecordingEnvironment::new("2.00,2.00"),
    ];
    let probes: Vec<_> = envs.iter().map(RecordingEnvironment::probe).collect();
    let mut bridge = MultiEnvBridge::new(&config, Box::new(pool), Box::new(envs));
    bridge.start_training();

    // The peer's own ENV claim is overridden by its slot.
    first.send("ENV=1;ACT=1.0,2.0").unwrap();
    second.send("RESET").unwrap();
    tick_until(
        || bridge.tick(),
        |r| sent_count(r) == 1 && r.iter().any(|r| r.resets.contains(&EnvId(1))),
    );

    assert_eq!(probes[0].actions(), ["1.0,2.0"]);
    assert_eq!(probes[1].reset_count(), 1);
    assert!(probes[1].actions().is_empty());
    assert_eq!(first.recv().unwrap(), "OBS=1.00,1.00;REW=0.25;DONE=0;ENV=0");
}
