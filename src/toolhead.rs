// src/toolhead.rs
//! Toolhead motion coordinator.
//!
//! Accepts user-level move requests, validates them against kinematics
//! and extruder limits, runs them through the lookahead queue, emits
//! trapezoids into the segment queue, and paces submission so the MCU
//! command buffers stay between the low and high water marks.

use std::rc::Rc;

use serde::Serialize;

use crate::config::{Config, QmodeConfig};
use crate::error::{CommandError, ToolheadError};
use crate::events::{EventBus, ToolheadEvent};
use crate::extruder::{DummyExtruder, Extruder};
use crate::kinematics::Kinematics;
use crate::mcu::McuLink;
use crate::motion::{Coord, Move, MoveQueue, PlannerLimits, TimingCallback, TrapQ};
use crate::reactor::{self, Completion, Reactor, TimerHandle};
use crate::scheduler::PrintClock;
use crate::zpos::ZPosRecorder;

/// Print time released per drip segment.
pub const DRIP_SEGMENT_TIME: f64 = 0.050;
/// Extra lead retained ahead of the MCU while dripping.
pub const DRIP_TIME: f64 = 0.100;

const STALL_RECHECK_PAD: f64 = 0.100;
const PRIMING_DELAY: f64 = 0.100;

/// Queueing state of the coordinator. `Main` is steady-state streaming;
/// the others gate how `print_time` is rebased and flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuingState {
    Main,
    Flushed,
    Priming,
    Drip,
}

impl QueuingState {
    pub fn is_special(self) -> bool {
        self != QueuingState::Main
    }
}

/// Snapshot reported through the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ToolheadStatus {
    pub print_time: f64,
    pub stalls: u32,
    pub estimated_print_time: f64,
    pub extruder: String,
    pub position: [f64; 4],
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_accel_to_decel: f64,
    pub square_corner_velocity: f64,
    pub g29_flag: bool,
    pub homed_axes: String,
    pub axis_minimum: [f64; 3],
    pub axis_maximum: [f64; 3],
}

pub struct ToolHead {
    reactor: Rc<dyn Reactor>,
    all_mcus: Vec<Rc<dyn McuLink>>,
    kin: Box<dyn Kinematics>,
    extruder: Box<dyn Extruder>,
    trapq: TrapQ,
    move_queue: MoveQueue,
    clock: PrintClock,
    events: EventBus,
    can_pause: bool,
    commanded_pos: [f64; 4],
    // Velocity and acceleration control
    max_velocity: f64,
    max_accel: f64,
    requested_accel_to_decel: f64,
    max_accel_to_decel: f64,
    square_corner_velocity: f64,
    square_corner_max_velocity: f64,
    junction_deviation: f64,
    // Print time tracking
    buffer_time_low: f64,
    buffer_time_high: f64,
    buffer_time_start: f64,
    queuing_state: QueuingState,
    need_check_stall: f64,
    flush_timer: TimerHandle,
    idle_flush_print_time: f64,
    print_stall: u32,
    drip_completion: Option<Completion>,
    last_kin_move_time: f64,
    // Misc
    g29_flag: bool,
    qmode_flag: bool,
    qmode_limits: Option<QmodeConfig>,
    zpos: Option<ZPosRecorder>,
}

impl ToolHead {
    pub fn new(
        config: &Config,
        reactor: Rc<dyn Reactor>,
        mcu: Rc<dyn McuLink>,
        kin: Box<dyn Kinematics>,
    ) -> Self {
        let p = &config.printer;
        let can_pause = !mcu.is_fileoutput();
        let flush_timer = reactor.register_timer(reactor::NEVER);
        let mut move_queue = MoveQueue::new();
        move_queue.set_flush_time(p.buffer_time_high);
        let mut toolhead = Self {
            reactor,
            all_mcus: vec![mcu],
            kin,
            extruder: Box::new(DummyExtruder),
            trapq: TrapQ::new(),
            move_queue,
            clock: PrintClock::new(p.move_flush_time),
            events: EventBus::new(),
            can_pause,
            commanded_pos: [0.0; 4],
            max_velocity: p.max_velocity,
            max_accel: p.max_accel,
            requested_accel_to_decel: p.accel_to_decel(),
            max_accel_to_decel: p.accel_to_decel(),
            square_corner_velocity: p.square_corner_velocity,
            square_corner_max_velocity: p.square_corner_max_velocity,
            junction_deviation: 0.0,
            buffer_time_low: p.buffer_time_low,
            buffer_time_high: p.buffer_time_high,
            buffer_time_start: p.buffer_time_start,
            queuing_state: QueuingState::Flushed,
            need_check_stall: -1.0,
            flush_timer,
            idle_flush_print_time: 0.0,
            print_stall: 0,
            drip_completion: None,
            last_kin_move_time: 0.0,
            g29_flag: false,
            qmode_flag: false,
            qmode_limits: config.qmode.clone(),
            zpos: p.z_pos_file.as_ref().map(ZPosRecorder::open),
        };
        toolhead.calc_junction_deviation();
        toolhead
    }

    /// Register a secondary MCU to be flushed alongside the primary.
    pub fn add_mcu(&mut self, mcu: Rc<dyn McuLink>) {
        self.all_mcus.push(mcu);
    }

    fn mcu(&self) -> &dyn McuLink {
        &*self.all_mcus[0]
    }

    fn planner_limits(&self) -> PlannerLimits {
        PlannerLimits {
            max_velocity: self.max_velocity,
            max_accel: self.max_accel,
            max_accel_to_decel: self.max_accel_to_decel,
            junction_deviation: self.junction_deviation,
        }
    }

    fn update_clock(&mut self, next_print_time: f64) {
        self.clock.update_move_time(
            next_print_time,
            &mut self.trapq,
            &mut *self.extruder,
            &self.all_mcus,
        );
    }

    fn sync_print_time(&mut self) {
        let curtime = self.reactor.monotonic();
        let est_print_time = self.mcu().estimated_print_time(curtime);
        if let Some(print_time) = self
            .clock
            .calc_print_time(est_print_time, self.buffer_time_start)
        {
            self.events.emit(&ToolheadEvent::SyncPrintTime {
                eventtime: curtime,
                est_print_time,
                print_time,
            });
        }
    }

    /// Plan the queue and submit any ready prefix downstream.
    async fn flush_move_queue(&mut self, lazy: bool) -> Result<(), ToolheadError> {
        let moves = self.move_queue.flush(lazy);
        if moves.is_empty() {
            return Ok(());
        }
        self.process_moves(moves).await
    }

    async fn process_moves(&mut self, moves: Vec<Move>) -> Result<(), ToolheadError> {
        // Resync print_time if necessary
        if self.queuing_state.is_special() {
            if self.queuing_state != QueuingState::Drip {
                // Transition from "Flushed"/"Priming" state to main state
                self.queuing_state = QueuingState::Main;
                self.need_check_stall = -1.0;
                self.reactor.update_timer(self.flush_timer, reactor::NOW);
            }
            self.sync_print_time();
        }
        // Queue moves into the trapezoid motion queue
        let mut next_move_time = self.clock.print_time();
        for mut m in moves {
            if m.is_kinematic_move {
                self.trapq.append(
                    next_move_time,
                    m.accel_t,
                    m.cruise_t,
                    m.decel_t,
                    Coord::new(m.start_pos[0], m.start_pos[1], m.start_pos[2]),
                    Coord::new(m.axes_r[0], m.axes_r[1], m.axes_r[2]),
                    m.start_v,
                    m.cruise_v,
                    m.accel,
                );
            }
            if m.axes_d[3] != 0.0 {
                self.extruder.process_move(next_move_time, &m);
            }
            next_move_time += m.total_time();
            for callback in m.take_timing_callbacks() {
                callback(next_move_time);
            }
        }
        // Generate steps for moves
        if self.queuing_state.is_special() {
            self.update_drip_move_time(next_move_time).await?;
        }
        self.update_clock(next_move_time);
        self.last_kin_move_time = self.last_kin_move_time.max(next_move_time);
        Ok(())
    }

    /// Transition to the Flushed state, draining the lookahead queue and
    /// pushing step generation past all scheduled motion.
    pub async fn flush_step_generation(&mut self) -> Result<(), ToolheadError> {
        self.flush_move_queue(false).await?;
        self.queuing_state = QueuingState::Flushed;
        self.need_check_stall = -1.0;
        self.reactor.update_timer(self.flush_timer, reactor::NEVER);
        self.move_queue.set_flush_time(self.buffer_time_high);
        self.idle_flush_print_time = 0.0;
        let kin_flush_delay = self.clock.kin_flush_delay();
        let flush_time = (self.last_kin_move_time + kin_flush_delay)
            .max(self.clock.print_time() - kin_flush_delay);
        self.clock.bump_last_kin_flush(flush_time);
        let target = self.clock.print_time().max(self.clock.last_kin_flush_time());
        self.update_clock(target);
        Ok(())
    }

    async fn flush_lookahead(&mut self) -> Result<(), ToolheadError> {
        if self.queuing_state.is_special() {
            return self.flush_step_generation().await;
        }
        self.flush_move_queue(false).await
    }

    pub async fn get_last_move_time(&mut self) -> Result<f64, ToolheadError> {
        self.flush_lookahead().await?;
        if self.queuing_state.is_special() {
            self.sync_print_time();
        }
        Ok(self.clock.print_time())
    }

    async fn check_stall(&mut self) {
        let mut eventtime = self.reactor.monotonic();
        if self.queuing_state.is_special() {
            if self.idle_flush_print_time != 0.0 {
                // Was in "Flushed" state and got there from idle input
                let est_print_time = self.mcu().estimated_print_time(eventtime);
                if est_print_time < self.idle_flush_print_time {
                    self.print_stall += 1;
                    tracing::debug!(stalls = self.print_stall, "print stall detected");
                }
                self.idle_flush_print_time = 0.0;
            }
            // Transition to "Priming" state
            self.queuing_state = QueuingState::Priming;
            self.need_check_stall = -1.0;
            self.reactor
                .update_timer(self.flush_timer, eventtime + PRIMING_DELAY);
        }
        // Check if there are lots of queued moves and stall if so
        let mut est_print_time;
        loop {
            est_print_time = self.mcu().estimated_print_time(eventtime);
            let buffer_time = self.clock.print_time() - est_print_time;
            let stall_time = buffer_time - self.buffer_time_high;
            if stall_time <= 0.0 {
                break;
            }
            if !self.can_pause {
                self.need_check_stall = reactor::NEVER;
                return;
            }
            eventtime = self.reactor.pause(eventtime + stall_time.min(1.0)).await;
        }
        if self.queuing_state == QueuingState::Main {
            // In main state - defer stall checking until needed
            self.need_check_stall = est_print_time + self.buffer_time_high + STALL_RECHECK_PAD;
        }
    }

    /// Flush timer callback: returns the next waketime. Any failure in
    /// this path triggers controlled shutdown.
    pub async fn flush_handler(&mut self, eventtime: f64) -> f64 {
        match self.flush_handler_inner(eventtime).await {
            Ok(waketime) => waketime,
            Err(err) => {
                tracing::error!(%err, "exception in flush_handler");
                self.invoke_shutdown("Exception in flush_handler");
                reactor::NEVER
            }
        }
    }

    async fn flush_handler_inner(&mut self, eventtime: f64) -> Result<f64, ToolheadError> {
        let print_time = self.clock.print_time();
        let buffer_time = print_time - self.mcu().estimated_print_time(eventtime);
        if buffer_time > self.buffer_time_low {
            // Running normally - reschedule the check
            return Ok(eventtime + buffer_time - self.buffer_time_low);
        }
        // Under the low buffer mark - flush the lookahead queue
        self.flush_step_generation().await?;
        if print_time != self.clock.print_time() {
            self.idle_flush_print_time = self.clock.print_time();
        }
        Ok(reactor::NEVER)
    }

    fn invoke_shutdown(&mut self, reason: &str) {
        self.events.emit(&ToolheadEvent::Shutdown {
            reason: reason.to_string(),
        });
        self.handle_shutdown();
    }

    /// Shutdown hook: pausing is disabled and pending lookahead state is
    /// dropped.
    pub fn handle_shutdown(&mut self) {
        self.can_pause = false;
        self.move_queue.reset();
    }

    fn record_z_pos(&mut self, z: f64) {
        if self.zpos.is_none() {
            return;
        }
        let eventtime = self.reactor.monotonic();
        if !self.kin.get_status(eventtime).homed_axes.contains('z') {
            return;
        }
        if let Some(recorder) = &mut self.zpos {
            recorder.record(z);
        }
    }

    // Movement commands

    pub fn get_position(&self) -> [f64; 4] {
        self.commanded_pos
    }

    /// Force the logical position. Axes listed in `homing_axes` become
    /// homed.
    pub async fn set_position(
        &mut self,
        newpos: [f64; 4],
        homing_axes: &[usize],
    ) -> Result<(), ToolheadError> {
        self.flush_step_generation().await?;
        self.trapq.set_position(
            self.clock.print_time(),
            Coord::new(newpos[0], newpos[1], newpos[2]),
        );
        self.commanded_pos = newpos;
        self.kin.set_position(newpos, homing_axes);
        self.events.emit(&ToolheadEvent::SetPosition);
        Ok(())
    }

    /// Queue a straight-line move to `newpos` at `speed`.
    pub async fn move_to(&mut self, newpos: [f64; 4], speed: f64) -> Result<(), ToolheadError> {
        self.record_z_pos(newpos[2]);
        let mut m = Move::new(&self.planner_limits(), self.commanded_pos, newpos, speed);
        if m.move_d == 0.0 {
            return Ok(());
        }
        if m.is_kinematic_move {
            self.kin.check_move(&mut m)?;
        }
        if m.axes_d[3] != 0.0 {
            self.extruder.check_move(&mut m)?;
        }
        self.commanded_pos = m.end_pos;
        let extruder_v2 = match self.move_queue.get_last() {
            Some(prev) => self.extruder.calc_junction(prev, &m),
            None => m.max_cruise_v2,
        };
        if self.move_queue.add_move(m, extruder_v2) {
            // Enough moves queued to reach the target flush time
            self.flush_move_queue(true).await?;
        }
        if self.clock.print_time() > self.need_check_stall {
            self.check_stall().await;
        }
        Ok(())
    }

    /// Move with partial coordinates; unspecified axes hold position.
    pub async fn manual_move(
        &mut self,
        coord: [Option<f64>; 4],
        speed: f64,
    ) -> Result<(), ToolheadError> {
        let mut curpos = self.commanded_pos;
        for (i, axis) in coord.iter().enumerate() {
            if let Some(value) = axis {
                curpos[i] = *value;
            }
        }
        self.move_to(curpos, speed).await?;
        self.events.emit(&ToolheadEvent::ManualMove);
        Ok(())
    }

    /// Advance the schedule without motion.
    pub async fn dwell(&mut self, delay: f64) -> Result<(), ToolheadError> {
        let next_print_time = self.get_last_move_time().await? + delay.max(0.0);
        self.update_clock(next_print_time);
        self.check_stall().await;
        Ok(())
    }

    /// Block until all queued motion has been reached by the MCU.
    pub async fn wait_moves(&mut self) -> Result<(), ToolheadError> {
        self.flush_lookahead().await?;
        let mut eventtime = self.reactor.monotonic();
        while !self.queuing_state.is_special()
            || self.clock.print_time() >= self.mcu().estimated_print_time(eventtime)
        {
            if !self.can_pause {
                break;
            }
            eventtime = self.reactor.pause(eventtime + 0.100).await;
        }
        Ok(())
    }

    pub fn set_extruder(&mut self, extruder: Box<dyn Extruder>, extrude_pos: f64) {
        self.extruder = extruder;
        self.commanded_pos[3] = extrude_pos;
    }

    pub fn get_extruder(&self) -> &dyn Extruder {
        &*self.extruder
    }

    // Homing "drip move" handling

    async fn update_drip_move_time(&mut self, next_print_time: f64) -> Result<(), ToolheadError> {
        let flush_delay =
            DRIP_TIME + self.clock.move_flush_time() + self.clock.kin_flush_delay();
        while self.clock.print_time() < next_print_time {
            let Some(completion) = self.drip_completion.clone() else {
                break;
            };
            if completion.test() {
                return Err(ToolheadError::DripEnd);
            }
            let curtime = self.reactor.monotonic();
            let est_print_time = self.mcu().estimated_print_time(curtime);
            let wait_time = self.clock.print_time() - est_print_time - flush_delay;
            if wait_time > 0.0 && self.can_pause {
                // Pause before sending more steps
                self.reactor
                    .wait_completion(&completion, curtime + wait_time)
                    .await;
                continue;
            }
            let npt = (self.clock.print_time() + DRIP_SEGMENT_TIME).min(next_print_time);
            self.update_clock(npt);
        }
        Ok(())
    }

    /// Submit a move in low-latency segments, abortable at any segment
    /// boundary via `drip_completion`. Used while homing and probing.
    pub async fn drip_move(
        &mut self,
        newpos: [f64; 4],
        speed: f64,
        drip_completion: Completion,
    ) -> Result<(), ToolheadError> {
        self.dwell(self.clock.kin_flush_delay()).await?;
        // Transition from "Flushed"/"Priming"/main state to "Drip" state
        self.flush_move_queue(false).await?;
        self.queuing_state = QueuingState::Drip;
        self.need_check_stall = reactor::NEVER;
        self.reactor.update_timer(self.flush_timer, reactor::NEVER);
        self.move_queue.set_flush_time(self.buffer_time_high);
        self.idle_flush_print_time = 0.0;
        self.drip_completion = Some(drip_completion);
        // Submit the move; transmit in "drip" mode
        let flush_result = match self.move_to(newpos, speed).await {
            Err(ToolheadError::Command(err)) => {
                self.drip_completion = None;
                self.flush_step_generation().await?;
                return Err(err.into());
            }
            Err(ToolheadError::DripEnd) => Err(ToolheadError::DripEnd),
            Ok(()) => self.flush_move_queue(false).await,
        };
        if let Err(ToolheadError::DripEnd) = flush_result {
            tracing::debug!("drip move cancelled");
            self.move_queue.reset();
            self.trapq.finalize_moves(reactor::NEVER);
        }
        // Exit "Drip" state
        self.drip_completion = None;
        self.flush_step_generation().await
    }

    // Misc commands

    /// Periodic statistics line plus an activity flag.
    pub fn stats(&self, eventtime: f64) -> (bool, String) {
        let print_time = self.clock.print_time();
        for mcu in &self.all_mcus {
            mcu.check_active(print_time, eventtime);
        }
        let mut buffer_time = print_time - self.mcu().estimated_print_time(eventtime);
        let is_active = buffer_time > -60.0 || !self.queuing_state.is_special();
        if self.queuing_state == QueuingState::Drip {
            buffer_time = 0.0;
        }
        (
            is_active,
            format!(
                "print_time={:.3} buffer_time={:.3} print_stall={}",
                print_time,
                buffer_time.max(0.0),
                self.print_stall
            ),
        )
    }

    pub fn check_busy(&self, eventtime: f64) -> (f64, f64, bool) {
        let est_print_time = self.mcu().estimated_print_time(eventtime);
        (
            self.clock.print_time(),
            est_print_time,
            self.move_queue.is_empty(),
        )
    }

    pub fn get_status(&self, eventtime: f64) -> ToolheadStatus {
        let kin_status = self.kin.get_status(eventtime);
        ToolheadStatus {
            print_time: self.clock.print_time(),
            stalls: self.print_stall,
            estimated_print_time: self.mcu().estimated_print_time(eventtime),
            extruder: self.extruder.name().to_string(),
            position: self.commanded_pos,
            max_velocity: self.max_velocity,
            max_accel: self.max_accel,
            max_accel_to_decel: self.requested_accel_to_decel,
            square_corner_velocity: self.square_corner_velocity,
            g29_flag: self.g29_flag,
            homed_axes: kin_status.homed_axes,
            axis_minimum: kin_status.axis_minimum,
            axis_maximum: kin_status.axis_maximum,
        }
    }

    pub fn get_kinematics(&self) -> &dyn Kinematics {
        &*self.kin
    }

    pub fn get_trapq(&self) -> &TrapQ {
        &self.trapq
    }

    pub fn register_step_generator(&mut self, generator: crate::scheduler::StepGenerator) {
        self.clock.register_step_generator(generator);
    }

    /// Track a step generator scan window change; forces a full flush so
    /// the new window applies from a clean boundary.
    pub async fn note_step_generation_scan_time(
        &mut self,
        delay: f64,
        old_delay: f64,
    ) -> Result<(), ToolheadError> {
        self.flush_step_generation().await?;
        self.clock.note_scan_time(delay, old_delay);
        Ok(())
    }

    /// Invoke `callback` with the end time of the currently queued tail
    /// move, or immediately when the queue is idle. Callbacks fire in
    /// move-batch order.
    pub async fn register_lookahead_callback(
        &mut self,
        callback: TimingCallback,
    ) -> Result<(), ToolheadError> {
        if self.move_queue.get_last().is_none() {
            let last_move_time = self.get_last_move_time().await?;
            callback(last_move_time);
            return Ok(());
        }
        self.move_queue.add_callback_to_last(callback);
        Ok(())
    }

    /// Note motion scheduled outside the lookahead queue (homing helpers).
    pub fn note_kinematic_activity(&mut self, kin_time: f64) {
        self.last_kin_move_time = self.last_kin_move_time.max(kin_time);
    }

    pub fn get_max_velocity(&self) -> (f64, f64) {
        (self.max_velocity, self.max_accel)
    }

    fn calc_junction_deviation(&mut self) {
        let scv2 = self.square_corner_velocity * self.square_corner_velocity;
        self.junction_deviation = scv2 * (2.0_f64.sqrt() - 1.0) / self.max_accel;
        self.max_accel_to_decel = self.requested_accel_to_decel.min(self.max_accel);
    }

    // Gcode-facing command handlers

    /// G4: dwell for `millis` milliseconds.
    pub async fn cmd_g4(&mut self, millis: f64) -> Result<(), ToolheadError> {
        self.dwell(millis.max(0.0) / 1000.0).await
    }

    /// M400: wait for all queued moves to complete.
    pub async fn cmd_m400(&mut self) -> Result<(), ToolheadError> {
        self.wait_moves().await
    }

    /// M204: set acceleration. `S` at or below 100 is coerced to 100 to
    /// match firmware expectations; otherwise the minimum of `P`/`T`
    /// applies.
    pub fn cmd_m204(
        &mut self,
        s: Option<f64>,
        p: Option<f64>,
        t: Option<f64>,
        commandline: &str,
    ) -> Result<(), CommandError> {
        let accel = match s {
            Some(value) if value <= 100.0 => 100.0,
            Some(value) => value,
            None => match (p, t) {
                (Some(p), Some(t)) if p > 0.0 && t > 0.0 => p.min(t),
                _ => {
                    return Err(CommandError::InvalidCommand {
                        commandline: commandline.to_string(),
                    });
                }
            },
        };
        self.max_accel = accel;
        self.calc_junction_deviation();
        tracing::debug!(accel, "M204 acceleration set");
        Ok(())
    }

    /// SET_VELOCITY_LIMIT: update motion limits. Qmode caps clamp the
    /// acceleration values while active; SCV is clamped to its configured
    /// ceiling. With no arguments the current limits are reported.
    pub fn cmd_set_velocity_limit(
        &mut self,
        velocity: Option<f64>,
        accel: Option<f64>,
        square_corner_velocity: Option<f64>,
        accel_to_decel: Option<f64>,
    ) -> Option<String> {
        let (qmode_max_accel, qmode_max_accel_to_decel) = match &self.qmode_limits {
            Some(q) => (q.max_accel, q.max_accel_to_decel),
            None => (0.0, 0.0),
        };
        if let Some(value) = velocity {
            if value > 0.0 {
                self.max_velocity = value;
            } else {
                tracing::warn!(value, "ignoring non-positive VELOCITY");
            }
        }
        if let Some(value) = accel {
            if value > 0.0 {
                self.max_accel = if self.qmode_flag && qmode_max_accel > 0.0 {
                    value.min(qmode_max_accel)
                } else {
                    value
                };
            } else {
                tracing::warn!(value, "ignoring non-positive ACCEL");
            }
        }
        if let Some(value) = square_corner_velocity {
            if value >= 0.0 {
                self.square_corner_velocity = value.min(self.square_corner_max_velocity);
            } else {
                tracing::warn!(value, "ignoring negative SQUARE_CORNER_VELOCITY");
            }
        }
        if let Some(value) = accel_to_decel {
            if value > 0.0 {
                self.requested_accel_to_decel =
                    if self.qmode_flag && qmode_max_accel_to_decel > 0.0 {
                        value.min(qmode_max_accel_to_decel)
                    } else {
                        value
                    };
            } else {
                tracing::warn!(value, "ignoring non-positive ACCEL_TO_DECEL");
            }
        }
        self.calc_junction_deviation();
        if velocity.is_none()
            && accel.is_none()
            && square_corner_velocity.is_none()
            && accel_to_decel.is_none()
        {
            return Some(format!(
                "max_velocity: {:.6}\nmax_accel: {:.6}\nmax_accel_to_decel: {:.6}\nsquare_corner_velocity: {:.6}",
                self.max_velocity,
                self.max_accel,
                self.requested_accel_to_decel,
                self.square_corner_velocity
            ));
        }
        None
    }

    /// SET_G29_FLAG: pure flag for external reporting.
    pub fn cmd_set_g29_flag(&mut self, value: i64) {
        self.g29_flag = value == 1;
    }

    /// Enable or disable the Qmode acceleration caps.
    pub fn set_qmode(&mut self, active: bool) {
        self.qmode_flag = active;
    }

    // Introspection used by the driver loop and tests

    pub fn print_time(&self) -> f64 {
        self.clock.print_time()
    }

    pub fn last_kin_move_time(&self) -> f64 {
        self.last_kin_move_time
    }

    pub fn last_kin_flush_time(&self) -> f64 {
        self.clock.last_kin_flush_time()
    }

    pub fn kin_flush_delay(&self) -> f64 {
        self.clock.kin_flush_delay()
    }

    pub fn special_queuing_state(&self) -> QueuingState {
        self.queuing_state
    }

    pub fn lookahead_len(&self) -> usize {
        self.move_queue.len()
    }

    pub fn print_stall(&self) -> u32 {
        self.print_stall
    }

    pub fn idle_flush_print_time(&self) -> f64 {
        self.idle_flush_print_time
    }

    pub fn flush_timer(&self) -> TimerHandle {
        self.flush_timer
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::CartesianKinematics;
    use crate::mcu::SimMcu;
    use crate::reactor::SimReactor;

    fn build() -> ToolHead {
        let config = Config::default();
        let reactor = Rc::new(SimReactor::new());
        let mcu = Rc::new(SimMcu::new());
        let kin = Box::new(CartesianKinematics::new(
            [(0.0, 235.0), (0.0, 235.0), (0.0, 250.0)],
            config.printer.max_z_velocity,
            config.printer.max_z_accel,
        ));
        ToolHead::new(&config, reactor, mcu, kin)
    }

    #[test]
    fn starts_flushed_with_timer_parked() {
        let config = Config::default();
        let reactor = Rc::new(SimReactor::new());
        let mcu = Rc::new(SimMcu::new());
        let kin = Box::new(CartesianKinematics::new(
            [(0.0, 235.0), (0.0, 235.0), (0.0, 250.0)],
            5.0,
            100.0,
        ));
        let toolhead = ToolHead::new(&config, reactor.clone(), mcu, kin);
        assert_eq!(toolhead.special_queuing_state(), QueuingState::Flushed);
        assert_eq!(toolhead.print_time(), 0.0);
        assert_eq!(toolhead.lookahead_len(), 0);
        assert_eq!(
            reactor.timer_waketime(toolhead.flush_timer()),
            crate::reactor::NEVER
        );
    }

    #[test]
    fn m204_coerces_low_s_values() {
        let mut toolhead = build();
        toolhead.cmd_m204(Some(50.0), None, None, "M204 S50").unwrap();
        assert_eq!(toolhead.get_max_velocity().1, 100.0);
        toolhead.cmd_m204(Some(4000.0), None, None, "M204 S4000").unwrap();
        assert_eq!(toolhead.get_max_velocity().1, 4000.0);
        toolhead
            .cmd_m204(None, Some(1500.0), Some(2500.0), "M204 P1500 T2500")
            .unwrap();
        assert_eq!(toolhead.get_max_velocity().1, 1500.0);
    }

    #[test]
    fn m204_without_usable_args_is_invalid() {
        let mut toolhead = build();
        let err = toolhead
            .cmd_m204(None, Some(1500.0), None, "M204 P1500")
            .unwrap_err();
        assert_eq!(err.key(), Some("key73"));
    }

    #[test]
    fn set_velocity_limit_reports_when_empty() {
        let mut toolhead = build();
        assert!(toolhead
            .cmd_set_velocity_limit(Some(200.0), None, None, None)
            .is_none());
        let report = toolhead
            .cmd_set_velocity_limit(None, None, None, None)
            .unwrap();
        assert!(report.contains("max_velocity: 200.000000"));
    }

    #[test]
    fn scv_clamped_to_configured_ceiling() {
        let mut toolhead = build();
        toolhead.cmd_set_velocity_limit(None, None, Some(500.0), None);
        let status = toolhead.get_status(0.0);
        assert_eq!(status.square_corner_velocity, 200.0);
    }

    #[test]
    fn qmode_caps_apply_only_while_active() {
        let mut config = Config::default();
        config.qmode = Some(QmodeConfig {
            max_accel: 2000.0,
            max_accel_to_decel: 1000.0,
        });
        let reactor = Rc::new(SimReactor::new());
        let mcu = Rc::new(SimMcu::new());
        let kin = Box::new(CartesianKinematics::new(
            [(0.0, 235.0), (0.0, 235.0), (0.0, 250.0)],
            5.0,
            100.0,
        ));
        let mut toolhead = ToolHead::new(&config, reactor, mcu, kin);
        toolhead.cmd_set_velocity_limit(None, Some(8000.0), None, None);
        assert_eq!(toolhead.get_max_velocity().1, 8000.0);
        toolhead.set_qmode(true);
        toolhead.cmd_set_velocity_limit(None, Some(8000.0), None, None);
        assert_eq!(toolhead.get_max_velocity().1, 2000.0);
    }

    #[test]
    fn g29_flag_round_trip() {
        let mut toolhead = build();
        assert!(!toolhead.get_status(0.0).g29_flag);
        toolhead.cmd_set_g29_flag(1);
        assert!(toolhead.get_status(0.0).g29_flag);
        toolhead.cmd_set_g29_flag(0);
        assert!(!toolhead.get_status(0.0).g29_flag);
    }

    #[test]
    fn junction_deviation_follows_scv_and_accel() {
        let toolhead = build();
        let expected = 25.0 * (2.0_f64.sqrt() - 1.0) / 3000.0;
        assert!((toolhead.planner_limits().junction_deviation - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn moves_rejected_before_homing() {
        let mut toolhead = build();
        let err = toolhead
            .move_to([10.0, 0.0, 0.0, 0.0], 50.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolheadError::Command(CommandError::MustHomeFirst)
        ));
        // Failed validation must not touch the commanded position
        assert_eq!(toolhead.get_position(), [0.0; 4]);
        assert_eq!(toolhead.lookahead_len(), 0);
    }

    #[tokio::test]
    async fn null_moves_are_dropped() {
        let mut toolhead = build();
        toolhead.set_position([5.0, 5.0, 0.0, 0.0], &[0, 1, 2]).await.unwrap();
        toolhead.move_to([5.0, 5.0, 0.0, 0.0], 50.0).await.unwrap();
        assert_eq!(toolhead.lookahead_len(), 0);
    }

    #[tokio::test]
    async fn extrusion_requires_an_extruder() {
        let mut toolhead = build();
        toolhead.set_position([0.0, 0.0, 0.0, 0.0], &[0, 1, 2]).await.unwrap();
        let err = toolhead
            .move_to([10.0, 0.0, 0.0, 1.0], 50.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ToolheadError::Command(CommandError::NoExtruder)
        ));
    }
}
