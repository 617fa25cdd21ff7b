// End-to-end tests: motion host driving the software coprocessor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use stepcore::{Config, FilamentCommand, HostError, MotionHost, RunState, SharedRegion};
use stepcore_simulator::{Simulator, SimulatorHandle, SimulatorOptions};

struct Rig {
    host: MotionHost,
    region: Arc<SharedRegion>,
    simulator: SimulatorHandle,
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.coprocessor.ring_slots = 8;
    config
}

fn rig(config: Config) -> Rig {
    let region = Arc::new(SharedRegion::new(config.coprocessor.ring_slots));
    let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
    let options = SimulatorOptions::from_config(&config).with_wake(wake_tx);
    let simulator = Simulator::new(region.clone(), options).spawn().unwrap();
    let host = MotionHost::new(&config, region.clone(), Some(wake_rx)).unwrap();
    Rig { host, region, simulator }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn assert_position(host: &MotionHost, expected: [f64; 4]) {
    let position = host.position().unwrap();
    for (got, want) in position.iter().zip(expected) {
        assert!((got - want).abs() < 1e-9, "position {:?}, expected {:?}", position, expected);
    }
}

#[test]
fn moves_reach_their_target() {
    let rig = rig(test_config());
    rig.host.start().unwrap();
    assert!(rig.host.enqueue_move(10.0, 0.0, 0.0, 0.0, 50.0, 0).unwrap());
    assert!(rig.host.enqueue_move(10.0, 10.0, 0.0, 1.0, 50.0, 0).unwrap());
    assert!(rig.host.enqueue_move(0.0, 10.0, 0.2, 2.0, 50.0, 0).unwrap());
    assert!(rig.host.sync());
    assert_position(&rig.host, [0.0, 10.0, 0.2, 2.0]);
    assert_eq!(rig.host.queue_depth(), 0);
    rig.host.shutdown().unwrap();
}

#[test]
fn many_moves_flow_through_a_small_ring() {
    let rig = rig(test_config());
    rig.host.start().unwrap();
    for i in 1..=100 {
        let x = f64::from(i % 20);
        let y = f64::from(i / 20);
        rig.host.enqueue_move(x, y, 0.0, 0.0, 120.0, 0).unwrap();
    }
    assert!(rig.host.sync());
    assert_position(&rig.host, [0.0, 5.0, 0.0, 0.0]);
    rig.host.shutdown().unwrap();
    let simulator = rig.simulator.join().unwrap();
    assert_eq!(simulator.executed(), 100);
}

#[test]
fn pause_and_resume_restore_the_exact_position() {
    let rig = rig(test_config());
    rig.host.start().unwrap();
    rig.host.enqueue_move(12.5, 7.25, 1.0, 0.0, 40.0, 0).unwrap();
    assert!(rig.host.sync());
    let before = rig.region.position();

    rig.host.pause().unwrap();
    assert_eq!(rig.region.pause_position(), [before[0], before[1], before[2]]);
    wait_until("pause lift", || rig.region.position()[2] == before[2] + 2000);

    rig.host.resume().unwrap();
    wait_until("resume", || rig.host.run_state().unwrap() == RunState::Print);
    assert_eq!(rig.region.position(), before);
    rig.host.shutdown().unwrap();
}

#[test]
fn pause_mid_print_still_finishes_the_moves() {
    let rig = rig(test_config());
    for i in 1..=6 {
        rig.host.enqueue_move(f64::from(i) * 5.0, 0.0, 0.0, 0.0, 60.0, 0).unwrap();
    }
    rig.host.start().unwrap();
    rig.host.pause().unwrap();
    assert!(rig.host.resume().is_ok());
    assert!(rig.host.sync());
    assert_position(&rig.host, [30.0, 0.0, 0.0, 0.0]);
    rig.host.shutdown().unwrap();
}

#[test]
fn paused_gate_holds_blocks_released_after_pausing() {
    let rig = rig(test_config());
    rig.host.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    rig.host.pause().unwrap();
    assert!(rig.host.enqueue_move(10.0, 0.0, 0.0, 0.0, 60.0, 0).unwrap());
    std::thread::sleep(Duration::from_millis(50));
    let status = rig.host.status().unwrap();
    assert_eq!(status.dispatched, 0);
    assert_eq!(status.planner_blocks, 1);

    rig.host.resume().unwrap();
    assert!(rig.host.sync());
    assert_position(&rig.host, [10.0, 0.0, 0.0, 0.0]);
    rig.host.shutdown().unwrap();
}

#[test]
fn invalid_requests_are_rejected() {
    let rig = rig(test_config());
    assert!(matches!(rig.host.pause(), Err(HostError::RunState(_))));
    assert!(matches!(rig.host.resume(), Err(HostError::RunState(_))));
    assert_eq!(rig.host.run_state().unwrap(), RunState::Idle);
    rig.host.shutdown().unwrap();
}

#[test]
fn stop_before_start_discards_queued_moves() {
    let rig = rig(test_config());
    for i in 1..=4 {
        rig.host.enqueue_move(f64::from(i) * 10.0, 0.0, 0.0, 0.0, 60.0, 0).unwrap();
    }
    wait_until("records in the ring", || rig.host.queue_depth() == 4);
    rig.host.stop(false).unwrap();
    assert!(rig.host.status().unwrap().stopped);
    assert!(!rig.host.enqueue_move(1.0, 1.0, 0.0, 0.0, 60.0, 0).unwrap());

    rig.host.start().unwrap();
    assert!(!rig.host.status().unwrap().stopped);
    assert_eq!(rig.host.queue_depth(), 0);
    assert!(rig.host.enqueue_move(5.0, 0.0, 0.0, 0.0, 60.0, 0).unwrap());
    assert!(rig.host.sync());
    assert_position(&rig.host, [5.0, 0.0, 0.0, 0.0]);
    rig.host.shutdown().unwrap();
}

#[test]
fn stop_while_paused_lifts_and_restarts_from_there() {
    let rig = rig(test_config());
    rig.host.start().unwrap();
    rig.host.pause().unwrap();
    wait_until("pause lift", || rig.region.position()[2] == 2000);
    for i in 1..=4 {
        rig.host.enqueue_move(f64::from(i) * 10.0, 0.0, 0.0, 0.0, 60.0, 0).unwrap();
    }
    rig.host.stop(false).unwrap();
    wait_until("idle after stop", || rig.host.run_state().unwrap() == RunState::Idle);
    // 5 mm pause lift plus the 10 mm stop lift.
    assert_position(&rig.host, [0.0, 0.0, 15.0, 0.0]);

    rig.host.start().unwrap();
    assert_eq!(rig.host.status().unwrap().planner_position_mm, [0.0, 0.0, 15.0, 0.0]);
    rig.host.enqueue_move(5.0, 0.0, 15.0, 0.0, 60.0, 0).unwrap();
    assert!(rig.host.sync());
    assert_position(&rig.host, [5.0, 0.0, 15.0, 0.0]);
    rig.host.shutdown().unwrap();
}

#[test]
fn blocking_stop_finishes_queued_moves_first() {
    let rig = rig(test_config());
    rig.host.start().unwrap();
    rig.host.enqueue_move(10.0, 0.0, 0.0, 0.0, 60.0, 0).unwrap();
    rig.host.enqueue_move(10.0, 10.0, 0.0, 0.0, 60.0, 0).unwrap();
    rig.host.stop(true).unwrap();
    wait_until("idle after stop", || rig.host.run_state().unwrap() == RunState::Idle);
    assert_position(&rig.host, [10.0, 10.0, 10.0, 0.0]);
    rig.host.shutdown().unwrap();
}

#[test]
fn stop_handle_works_from_another_thread() {
    let rig = rig(test_config());
    rig.host.start().unwrap();
    let handle = rig.host.stop_handle();
    std::thread::spawn(move || handle.stop().unwrap()).join().unwrap();
    assert!(rig.host.status().unwrap().stopped);
    assert!(!rig.host.enqueue_move(10.0, 0.0, 0.0, 0.0, 60.0, 0).unwrap());
    wait_until("idle after stop", || rig.host.run_state().unwrap() == RunState::Idle);
    rig.host.shutdown().unwrap();
}

#[test]
fn commands_execute_in_order_with_moves() {
    let rig = rig(test_config());
    rig.host.start().unwrap();
    rig.host.enqueue_move(10.0, 0.0, 0.0, 0.0, 60.0, 0).unwrap();
    assert!(rig.host.enqueue_command(104).unwrap());
    rig.host.enqueue_move(20.0, 0.0, 0.0, 0.0, 60.0, 0).unwrap();
    assert!(rig.host.enqueue_command(105).unwrap());
    assert!(rig.host.sync());
    assert_eq!(rig.region.mcode_count(), 2);

    let trace = rig.simulator.trace();
    let kinds: Vec<&str> = trace.iter().map(|row| row.kind).collect();
    assert_eq!(kinds, vec!["move", "command", "move", "command"]);
    assert_eq!(trace[1].command, 104);
    assert_eq!(rig.host.status().unwrap().mcode_count, 2);
    rig.host.shutdown().unwrap();
}

#[test]
fn homing_zeroes_axes_and_resyncs_the_planner() {
    let rig = rig(test_config());
    rig.host.start().unwrap();
    rig.host.enqueue_move(10.0, 20.0, 0.0, 0.0, 60.0, 0).unwrap();
    rig.host.stop(true).unwrap();
    wait_until("idle after stop", || rig.host.run_state().unwrap() == RunState::Idle);

    rig.host.home(0b011).unwrap();
    assert_eq!(rig.host.run_state().unwrap(), RunState::Idle);
    assert_position(&rig.host, [0.0, 0.0, 10.0, 0.0]);
    assert_eq!(rig.host.status().unwrap().planner_position_mm, [0.0, 0.0, 10.0, 0.0]);
    rig.host.shutdown().unwrap();
}

#[test]
fn filament_and_test_modes_return_to_idle() {
    let rig = rig(test_config());
    rig.host.load_filament(FilamentCommand::Start).unwrap();
    assert_eq!(rig.host.run_state().unwrap(), RunState::LoadFilament);
    rig.host.load_filament(FilamentCommand::Stop).unwrap();
    rig.host.test_mode(true).unwrap();
    assert_eq!(rig.host.run_state().unwrap(), RunState::Test);
    rig.host.test_mode(false).unwrap();
    assert_eq!(rig.host.run_state().unwrap(), RunState::Idle);
    rig.host.shutdown().unwrap();
}

#[test]
fn shutdown_while_idle_discards_and_exits() {
    let rig = rig(test_config());
    rig.host.enqueue_move(10.0, 0.0, 0.0, 0.0, 60.0, 0).unwrap();
    wait_until("record in the ring", || rig.host.queue_depth() == 1);
    rig.host.shutdown().unwrap();
    rig.host.shutdown().unwrap();
    let simulator = rig.simulator.join().unwrap();
    assert_eq!(simulator.executed(), 0);
    assert_eq!(simulator.stepper_positions, [0; 4]);
}

#[test]
fn host_runs_from_a_toml_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("printer.toml");
    std::fs::write(
        &path,
        r#"
[printer]
name = "bench"
kinematics = "corexy"

[axes]
steps_per_unit = [100.0, 100.0, 400.0, 95.0]

[coprocessor]
ring_slots = 8
"#,
    )
    .unwrap();
    let config = stepcore::config::load_config(path.to_str().unwrap()).unwrap();
    let rig = rig(config);
    rig.host.start().unwrap();
    rig.host.enqueue_move(10.0, 5.0, 0.0, 0.0, 60.0, 0).unwrap();
    assert!(rig.host.sync());
    // CoreXY motors run A = X + Y and B = X - Y.
    assert_eq!(&rig.region.position()[..2], &[1500, 500]);
    assert_position(&rig.host, [10.0, 5.0, 0.0, 0.0]);
    rig.host.shutdown().unwrap();
}

#[test]
fn mismatched_ring_size_is_a_config_error() {
    let config = test_config();
    let region = Arc::new(SharedRegion::new(4));
    assert!(matches!(
        MotionHost::new(&config, region, None),
        Err(HostError::Config(_))
    ));
}
