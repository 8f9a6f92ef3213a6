// End-to-end scenarios driving the toolhead against a simulated MCU.

use std::cell::RefCell;
use std::rc::Rc;

use printhead::config::Config;
use printhead::extruder::PrinterExtruder;
use printhead::kinematics::CartesianKinematics;
use printhead::mcu::SimMcu;
use printhead::McuLink;
use printhead::motion::TrapSegment;
use printhead::reactor::{Completion, NEVER, Reactor, SimReactor};
use printhead::toolhead::{QueuingState, ToolHead};

const EPS: f64 = 1e-9;

fn test_config() -> Config {
    let mut config = Config::default();
    config.printer.max_velocity = 100.0;
    config.printer.max_accel = 1000.0;
    config.printer.max_accel_to_decel = Some(500.0);
    config.extruder.min_extrude_temp = 0.0;
    config
}

fn build(config: &Config, fileoutput: bool) -> (Rc<SimReactor>, Rc<SimMcu>, ToolHead) {
    let reactor = Rc::new(SimReactor::new());
    let mcu = Rc::new(if fileoutput {
        SimMcu::new_fileoutput()
    } else {
        SimMcu::new()
    });
    let kin = Box::new(CartesianKinematics::new(
        [(0.0, 300.0), (0.0, 300.0), (0.0, 300.0)],
        config.printer.max_z_velocity,
        config.printer.max_z_accel,
    ));
    let mut toolhead = ToolHead::new(config, reactor.clone(), mcu.clone(), kin);
    let extruder = PrinterExtruder::new(
        &config.extruder,
        config.printer.max_velocity,
        config.printer.max_accel,
    );
    toolhead.set_extruder(Box::new(extruder), 0.0);
    (reactor, mcu, toolhead)
}

fn harness() -> (Rc<SimReactor>, Rc<SimMcu>, ToolHead) {
    build(&test_config(), false)
}

async fn home(toolhead: &mut ToolHead) {
    toolhead
        .set_position([0.0, 0.0, 0.0, 0.0], &[0, 1, 2])
        .await
        .unwrap();
}

/// All motion segments (history plus active), skipping position markers.
fn motion_segments(toolhead: &ToolHead) -> Vec<TrapSegment> {
    toolhead
        .get_trapq()
        .history()
        .chain(toolhead.get_trapq().active())
        .filter(|seg| seg.move_t > 0.0)
        .cloned()
        .collect()
}

fn segment_end_velocity(seg: &TrapSegment) -> f64 {
    seg.start_v + 2.0 * seg.half_accel * seg.move_t
}

// Scenario 1: single move produces the expected trapezoid.
#[tokio::test]
async fn single_move_trapezoid_times() {
    let (_reactor, _mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    toolhead.move_to([10.0, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    toolhead.get_last_move_time().await.unwrap();
    let segs = motion_segments(&toolhead);
    assert_eq!(segs.len(), 3);
    assert!((segs[0].move_t - 0.06).abs() < EPS);
    assert_eq!(segs[0].start_v, 0.0);
    assert_eq!(segs[0].half_accel, 500.0);
    assert!((segs[1].move_t - (10.0 - 3.6) / 60.0).abs() < EPS);
    assert_eq!(segs[1].start_v, 60.0);
    assert_eq!(segs[1].half_accel, 0.0);
    assert!((segs[2].move_t - 0.06).abs() < EPS);
    assert_eq!(segs[2].half_accel, -500.0);
    // Moves are scheduled after the idle rebase lead time
    assert!(segs[0].print_time >= 0.25 - EPS);
}

// Scenario 2: colinear chain cruises straight through both junctions.
#[tokio::test]
async fn straight_chain_has_no_internal_ramps() {
    let (_reactor, _mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    for x in [10.0, 20.0, 30.0] {
        toolhead.move_to([x, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    }
    toolhead.get_last_move_time().await.unwrap();
    let segs = motion_segments(&toolhead);
    // accel + cruise | cruise | cruise + decel
    assert_eq!(segs.len(), 5);
    for pair in segs.windows(2) {
        assert!(
            (segment_end_velocity(&pair[0]) - pair[1].start_v).abs() < 1e-6,
            "velocity discontinuity between segments"
        );
    }
    let cruise_time: f64 = segs
        .iter()
        .filter(|s| s.half_accel == 0.0)
        .map(|s| s.move_t)
        .sum();
    assert!((cruise_time - (30.0 - 3.6) / 60.0).abs() < 1e-6);
}

// Scenario 3: right-angle corner traversed at square_corner_velocity.
#[tokio::test]
async fn right_angle_corner_velocity() {
    let (_reactor, _mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    toolhead.move_to([10.0, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    toolhead.move_to([10.0, 10.0, 0.0, 0.0], 60.0).await.unwrap();
    toolhead.get_last_move_time().await.unwrap();
    let segs = motion_segments(&toolhead);
    assert_eq!(segs.len(), 6);
    // First move decelerates 60 -> 5 into the corner
    assert!((segment_end_velocity(&segs[2]) - 5.0).abs() < 1e-6);
    // Second move accelerates away from 5
    assert!((segs[3].start_v - 5.0).abs() < 1e-6);
    assert!(segs[3].axes_r.y > 0.99);
}

// Scenario 4: lazy flush keeps the still-improvable tail queued.
#[tokio::test]
async fn lazy_flush_retains_tail() {
    let (_reactor, _mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    // Initial countdown after a full flush is buffer_time_high (2s); three
    // one-second moves reach it.
    toolhead.move_to([60.0, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    assert_eq!(toolhead.lookahead_len(), 1);
    toolhead.move_to([120.0, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    assert_eq!(toolhead.lookahead_len(), 2);
    toolhead.move_to([180.0, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    assert_eq!(toolhead.special_queuing_state(), QueuingState::Main);
    let retained = toolhead.lookahead_len();
    assert!(retained >= 1, "tail with free end velocity stays queued");
    assert!(retained < 3, "planned prefix was submitted");
    assert!(toolhead.print_time() > 0.25);
}

// Scenario 5: backpressure pauses submission, and an idle flush followed
// by fresh input counts exactly one stall.
#[tokio::test]
async fn stall_cycle_counts_one_stall() {
    let (reactor, mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    let targets = [60.0, 120.0, 180.0, 240.0, 180.0, 120.0];
    for x in targets {
        toolhead.move_to([x, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    }
    // check_stall had to pause for the MCU to drain
    let paused_until = reactor.monotonic();
    assert!(paused_until > 0.0, "submission should have stalled");
    let buffer = toolhead.print_time() - mcu.estimated_print_time(paused_until);
    assert!(buffer <= 2.0 + 1e-6);

    // Idle: service the flush timer until it parks itself
    let mut guard = 0;
    loop {
        let now = reactor.monotonic();
        let waketime = toolhead.flush_handler(now).await;
        if waketime >= NEVER {
            break;
        }
        reactor.pause(waketime).await;
        guard += 1;
        assert!(guard < 20, "flush handler failed to settle");
    }
    assert_eq!(toolhead.special_queuing_state(), QueuingState::Flushed);
    assert!(toolhead.idle_flush_print_time() > 0.0);
    assert_eq!(toolhead.print_stall(), 0);

    // Fresh input arrives while the MCU is still behind the idle flush
    toolhead.move_to([60.0, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    assert_eq!(toolhead.print_stall(), 1);
    toolhead.move_to([120.0, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    assert_eq!(toolhead.print_stall(), 1, "stall counted exactly once");
}

// Scenario 6: drip move cancelled mid-flight.
#[tokio::test]
async fn drip_move_cancellation() {
    let (reactor, _mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    let completion = Completion::new();
    let cancel = completion.clone();
    reactor.schedule(1.0, move || cancel.complete());
    let start_time = toolhead.print_time();
    toolhead
        .drip_move([0.0, 0.0, 10.0, 0.0], 5.0, completion.clone())
        .await
        .unwrap();
    assert!(completion.test());
    assert_eq!(toolhead.special_queuing_state(), QueuingState::Flushed);
    assert_eq!(toolhead.lookahead_len(), 0);
    assert_eq!(toolhead.get_trapq().active_len(), 0, "trapq finalized");
    // The 2s worth of motion was released only partially before the cancel
    assert!(toolhead.print_time() > start_time);
    assert!(toolhead.print_time() < start_time + 2.0);
}

#[tokio::test]
async fn drip_move_with_preset_completion_aborts_immediately() {
    let (_reactor, _mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    let completion = Completion::new();
    completion.complete();
    toolhead
        .drip_move([0.0, 0.0, 10.0, 0.0], 5.0, completion)
        .await
        .unwrap();
    assert_eq!(toolhead.special_queuing_state(), QueuingState::Flushed);
    assert_eq!(toolhead.get_trapq().active_len(), 0);
}

#[tokio::test]
async fn drip_move_validation_failure_restores_state() {
    let (_reactor, _mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    let completion = Completion::new();
    let err = toolhead
        .drip_move([0.0, 0.0, 400.0, 0.0], 5.0, completion)
        .await
        .unwrap_err();
    assert!(matches!(err, printhead::ToolheadError::Command(_)));
    assert_eq!(toolhead.special_queuing_state(), QueuingState::Flushed);
    assert_eq!(toolhead.lookahead_len(), 0);
}

// Lookahead callbacks fire in move order with their moves' end times.
#[tokio::test]
async fn lookahead_callbacks_fire_in_order() {
    let (_reactor, _mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    let fired: Rc<RefCell<Vec<(&'static str, f64)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = fired.clone();
    toolhead
        .register_lookahead_callback(Box::new(move |t| sink.borrow_mut().push(("idle", t))))
        .await
        .unwrap();
    assert_eq!(fired.borrow().len(), 1, "empty queue fires immediately");

    toolhead.move_to([60.0, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    let sink = fired.clone();
    toolhead
        .register_lookahead_callback(Box::new(move |t| sink.borrow_mut().push(("first", t))))
        .await
        .unwrap();
    toolhead.move_to([120.0, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    let sink = fired.clone();
    toolhead
        .register_lookahead_callback(Box::new(move |t| sink.borrow_mut().push(("second", t))))
        .await
        .unwrap();
    assert_eq!(fired.borrow().len(), 1, "queued callbacks defer to flush");

    toolhead.get_last_move_time().await.unwrap();
    let fired = fired.borrow();
    let tags: Vec<_> = fired.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec!["idle", "first", "second"]);
    assert!(fired[0].1 <= fired[1].1);
    assert!(fired[1].1 < fired[2].1, "each callback sees its move's end");
}

// flush_step_generation is idempotent when nothing new was queued.
#[tokio::test]
async fn flush_step_generation_is_idempotent() {
    let (_reactor, mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    toolhead.move_to([20.0, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    toolhead.flush_step_generation().await.unwrap();
    let snapshot = (
        toolhead.print_time(),
        toolhead.last_kin_flush_time(),
        toolhead.last_kin_move_time(),
        toolhead.special_queuing_state(),
        toolhead.lookahead_len(),
        mcu.flushed_upto(),
    );
    toolhead.flush_step_generation().await.unwrap();
    let after = (
        toolhead.print_time(),
        toolhead.last_kin_flush_time(),
        toolhead.last_kin_move_time(),
        toolhead.special_queuing_state(),
        toolhead.lookahead_len(),
        mcu.flushed_upto(),
    );
    assert_eq!(snapshot, after);
}

// Scheduled times never move backwards across a whole command sequence.
#[tokio::test]
async fn time_monotonicity_across_operations() {
    let (reactor, _mcu, mut toolhead) = harness();
    let mut samples: Vec<(f64, f64, f64)> = Vec::new();
    let mut observe = |toolhead: &ToolHead, samples: &mut Vec<(f64, f64, f64)>| {
        samples.push((
            toolhead.print_time(),
            toolhead.last_kin_move_time(),
            toolhead.last_kin_flush_time(),
        ));
    };
    home(&mut toolhead).await;
    observe(&toolhead, &mut samples);
    toolhead.move_to([30.0, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    observe(&toolhead, &mut samples);
    toolhead.dwell(0.5).await.unwrap();
    observe(&toolhead, &mut samples);
    toolhead.move_to([30.0, 30.0, 0.0, 0.0], 60.0).await.unwrap();
    observe(&toolhead, &mut samples);
    toolhead.wait_moves().await.unwrap();
    observe(&toolhead, &mut samples);
    let now = reactor.monotonic();
    let waketime = toolhead.flush_handler(now).await;
    let _ = waketime;
    observe(&toolhead, &mut samples);
    for pair in samples.windows(2) {
        assert!(pair[1].0 >= pair[0].0, "print_time regressed");
        assert!(pair[1].1 >= pair[0].1, "last_kin_move_time regressed");
        assert!(pair[1].2 >= pair[0].2, "last_kin_flush_time regressed");
    }
}

// Dwell advances the schedule by the requested delay.
#[tokio::test]
async fn dwell_advances_print_time() {
    let (_reactor, _mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    let before = toolhead.get_last_move_time().await.unwrap();
    toolhead.dwell(0.5).await.unwrap();
    assert!(toolhead.print_time() >= before + 0.5 - EPS);
}

// wait_moves blocks until the MCU estimate catches the schedule.
#[tokio::test]
async fn wait_moves_drains_to_mcu() {
    let (reactor, mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    toolhead.move_to([60.0, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    toolhead.cmd_m400().await.unwrap();
    let now = reactor.monotonic();
    assert!(mcu.estimated_print_time(now) > toolhead.print_time() - EPS);
}

// Extrusion flows through the extruder's own queue.
#[tokio::test]
async fn extruding_move_updates_extruder_position() {
    let (_reactor, _mcu, mut toolhead) = harness();
    home(&mut toolhead).await;
    toolhead.move_to([10.0, 0.0, 0.0, 0.5], 40.0).await.unwrap();
    toolhead.get_last_move_time().await.unwrap();
    assert!((toolhead.get_extruder().last_position() - 0.5).abs() < EPS);
    let status = toolhead.get_status(0.0);
    assert_eq!(status.extruder, "extruder");
    assert_eq!(status.position[3], 0.5);
}

// A file-output MCU cannot be paced; submission never pauses.
#[tokio::test]
async fn fileoutput_mcu_never_stalls() {
    let (reactor, _mcu, mut toolhead) = build(&test_config(), true);
    home(&mut toolhead).await;
    for i in 1..=5 {
        let x = (i % 4) as f64 * 60.0 + 30.0;
        toolhead.move_to([x, 0.0, 0.0, 0.0], 60.0).await.unwrap();
    }
    assert_eq!(reactor.monotonic(), 0.0, "no cooperative pauses happened");
}
