// src/motion/planner.rs
//! Move requests and the lookahead queue.
//!
//! Planning is deferred: moves accumulate in the queue until enough
//! trailing time is buffered, then a backward pass over the whole queue
//! assigns junction velocities assuming a full stop after the last move.
//! Only the prefix whose timing can no longer improve is handed out on a
//! lazy flush.

use std::fmt;

/// Lookahead time buffered before a lazy flush is attempted.
pub const LOOKAHEAD_FLUSH_TIME: f64 = 0.250;

/// Planning accel for extrude-only moves; the extruder's own speed limit
/// applies during validation.
const EXTRUDE_ONLY_ACCEL: f64 = 99_999_999.9;

/// Toolhead velocity limits captured at move creation.
#[derive(Debug, Clone, Copy)]
pub struct PlannerLimits {
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_accel_to_decel: f64,
    pub junction_deviation: f64,
}

/// Deferred notification fired once a move's end time is known.
pub type TimingCallback = Box<dyn FnOnce(f64)>;

/// One straight-line move request.
///
/// Junction limits (`max_start_v2`, `max_smoothed_v2`) are refined as
/// neighbors arrive; the final trapezoid (`start_v`..`decel_t`) is filled
/// in by `set_junction` during queue flush.
pub struct Move {
    pub start_pos: [f64; 4],
    pub end_pos: [f64; 4],
    pub axes_d: [f64; 4],
    pub axes_r: [f64; 4],
    pub move_d: f64,
    pub is_kinematic_move: bool,
    pub junction_deviation: f64,
    pub accel: f64,
    pub max_cruise_v2: f64,
    pub delta_v2: f64,
    pub smooth_delta_v2: f64,
    pub max_start_v2: f64,
    pub max_smoothed_v2: f64,
    pub min_move_t: f64,
    pub start_v: f64,
    pub cruise_v: f64,
    pub end_v: f64,
    pub accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
    timing_callbacks: Vec<TimingCallback>,
}

impl Move {
    pub fn new(limits: &PlannerLimits, start_pos: [f64; 4], end_pos: [f64; 4], speed: f64) -> Self {
        let mut velocity = speed.min(limits.max_velocity);
        let mut axes_d = [
            end_pos[0] - start_pos[0],
            end_pos[1] - start_pos[1],
            end_pos[2] - start_pos[2],
            end_pos[3] - start_pos[3],
        ];
        let mut move_d =
            (axes_d[0] * axes_d[0] + axes_d[1] * axes_d[1] + axes_d[2] * axes_d[2]).sqrt();
        let mut end_pos = end_pos;
        let mut accel = limits.max_accel;
        let mut is_kinematic_move = true;
        if move_d < 0.000000001 {
            // Extrude only move
            end_pos = [start_pos[0], start_pos[1], start_pos[2], end_pos[3]];
            axes_d[0] = 0.0;
            axes_d[1] = 0.0;
            axes_d[2] = 0.0;
            move_d = axes_d[3].abs();
            accel = EXTRUDE_ONLY_ACCEL;
            velocity = speed;
            is_kinematic_move = false;
        }
        let inv_move_d = if move_d > 0.0 { 1.0 / move_d } else { 0.0 };
        let axes_r = [
            axes_d[0] * inv_move_d,
            axes_d[1] * inv_move_d,
            axes_d[2] * inv_move_d,
            axes_d[3] * inv_move_d,
        ];
        Move {
            start_pos,
            end_pos,
            axes_d,
            axes_r,
            move_d,
            is_kinematic_move,
            junction_deviation: limits.junction_deviation,
            accel,
            max_cruise_v2: velocity * velocity,
            delta_v2: 2.0 * move_d * accel,
            smooth_delta_v2: 2.0 * move_d * limits.max_accel_to_decel,
            max_start_v2: 0.0,
            max_smoothed_v2: 0.0,
            min_move_t: move_d / velocity,
            start_v: 0.0,
            cruise_v: 0.0,
            end_v: 0.0,
            accel_t: 0.0,
            cruise_t: 0.0,
            decel_t: 0.0,
            timing_callbacks: Vec::new(),
        }
    }

    /// Tighten this move's speed and accel limits during validation.
    pub fn limit_speed(&mut self, speed: f64, accel: f64) {
        let speed2 = speed * speed;
        if speed2 < self.max_cruise_v2 {
            self.max_cruise_v2 = speed2;
            self.min_move_t = self.move_d / speed;
        }
        self.accel = self.accel.min(accel);
        self.delta_v2 = 2.0 * self.move_d * self.accel;
        self.smooth_delta_v2 = self.smooth_delta_v2.min(self.delta_v2);
    }

    /// Compute the maximum junction velocity between `prev` and this move
    /// from the junction-deviation corner model. `extruder_v2` is the
    /// extruder-coupled cap supplied by the toolhead.
    pub fn calc_junction(&mut self, prev: &Move, extruder_v2: f64) {
        if !self.is_kinematic_move || !prev.is_kinematic_move {
            return;
        }
        let junction_cos_theta = -(self.axes_r[0] * prev.axes_r[0]
            + self.axes_r[1] * prev.axes_r[1]
            + self.axes_r[2] * prev.axes_r[2]);
        if junction_cos_theta > 0.999999 {
            // Full reversal keeps the seeded stop
            return;
        }
        let junction_cos_theta = junction_cos_theta.max(-0.999999);
        let sin_theta_d2 = (0.5 * (1.0 - junction_cos_theta)).sqrt();
        let r_jd = sin_theta_d2 / (1.0 - sin_theta_d2);
        // Approximated circle of the corner
        let tan_theta_d2 = sin_theta_d2 / (0.5 * (1.0 + junction_cos_theta)).sqrt();
        let move_centripetal_v2 = 0.5 * self.move_d * tan_theta_d2 * self.accel;
        let prev_centripetal_v2 = 0.5 * prev.move_d * tan_theta_d2 * prev.accel;
        self.max_start_v2 = (r_jd * self.junction_deviation * self.accel)
            .min(r_jd * prev.junction_deviation * prev.accel)
            .min(move_centripetal_v2)
            .min(prev_centripetal_v2)
            .min(extruder_v2)
            .min(self.max_cruise_v2)
            .min(prev.max_cruise_v2)
            .min(prev.max_start_v2 + prev.delta_v2);
        self.max_smoothed_v2 = self
            .max_start_v2
            .min(prev.max_smoothed_v2 + prev.smooth_delta_v2);
    }

    /// Solve the trapezoid for the given squared junction velocities.
    pub fn set_junction(&mut self, start_v2: f64, cruise_v2: f64, end_v2: f64) {
        // Determine accel, cruise, and decel portions of the move distance
        let half_inv_accel = 0.5 / self.accel;
        let accel_d = (cruise_v2 - start_v2) * half_inv_accel;
        let decel_d = (cruise_v2 - end_v2) * half_inv_accel;
        let cruise_d = self.move_d - accel_d - decel_d;
        // Determine move velocities
        self.start_v = start_v2.sqrt();
        self.cruise_v = cruise_v2.sqrt();
        self.end_v = end_v2.sqrt();
        // Determine time spent in each portion of move
        self.accel_t = accel_d / ((self.start_v + self.cruise_v) * 0.5);
        self.cruise_t = cruise_d / self.cruise_v;
        self.decel_t = decel_d / ((self.cruise_v + self.end_v) * 0.5);
    }

    pub fn total_time(&self) -> f64 {
        self.accel_t + self.cruise_t + self.decel_t
    }

    pub fn add_timing_callback(&mut self, callback: TimingCallback) {
        self.timing_callbacks.push(callback);
    }

    pub(crate) fn take_timing_callbacks(&mut self) -> Vec<TimingCallback> {
        std::mem::take(&mut self.timing_callbacks)
    }
}

impl fmt::Debug for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Move")
            .field("start_pos", &self.start_pos)
            .field("end_pos", &self.end_pos)
            .field("move_d", &self.move_d)
            .field("is_kinematic_move", &self.is_kinematic_move)
            .field("start_v", &self.start_v)
            .field("cruise_v", &self.cruise_v)
            .field("end_v", &self.end_v)
            .field("timing_callbacks", &self.timing_callbacks.len())
            .finish()
    }
}

/// Lookahead queue of pending moves.
pub struct MoveQueue {
    queue: Vec<Move>,
    junction_flush: f64,
}

impl MoveQueue {
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            junction_flush: LOOKAHEAD_FLUSH_TIME,
        }
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.junction_flush = LOOKAHEAD_FLUSH_TIME;
    }

    pub fn set_flush_time(&mut self, flush_time: f64) {
        self.junction_flush = flush_time;
    }

    pub fn get_last(&self) -> Option<&Move> {
        self.queue.last()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Attach a deferred timing callback to the tail move. Returns false
    /// when the queue is empty and the callback was not stored.
    pub fn add_callback_to_last(&mut self, callback: TimingCallback) -> bool {
        match self.queue.last_mut() {
            Some(last) => {
                last.add_timing_callback(callback);
                true
            }
            None => false,
        }
    }

    /// Queue a move, computing its junction against the previous tail.
    /// Returns true when enough time is buffered for a lazy flush.
    pub fn add_move(&mut self, mut m: Move, extruder_v2: f64) -> bool {
        let min_move_t = m.min_move_t;
        let first = self.queue.is_empty();
        if let Some(prev) = self.queue.last() {
            m.calc_junction(prev, extruder_v2);
        }
        self.queue.push(m);
        if first {
            return false;
        }
        self.junction_flush -= min_move_t;
        self.junction_flush <= 0.0
    }

    /// Run the lookahead pass and return the prefix of fully-planned moves.
    ///
    /// A lazy flush keeps any tail whose timing could still improve from
    /// future appends; a full flush plans and returns everything.
    pub fn flush(&mut self, lazy: bool) -> Vec<Move> {
        self.junction_flush = LOOKAHEAD_FLUSH_TIME;
        let mut update_flush_count = lazy;
        let mut flush_count = self.queue.len();
        if flush_count == 0 {
            return Vec::new();
        }
        // Traverse from last to first move and determine maximum junction
        // speed assuming the machine comes to a complete stop after the
        // last move.
        let mut delayed: Vec<(usize, f64, f64)> = Vec::new();
        let mut next_end_v2 = 0.0;
        let mut next_smoothed_v2 = 0.0;
        let mut peak_cruise_v2 = 0.0;
        for i in (0..self.queue.len()).rev() {
            let m = &self.queue[i];
            let delta_v2 = m.delta_v2;
            let smooth_delta_v2 = m.smooth_delta_v2;
            let max_cruise_v2 = m.max_cruise_v2;
            let reachable_start_v2 = next_end_v2 + delta_v2;
            let start_v2 = m.max_start_v2.min(reachable_start_v2);
            let reachable_smoothed_v2 = next_smoothed_v2 + smooth_delta_v2;
            let smoothed_v2 = m.max_smoothed_v2.min(reachable_smoothed_v2);
            if smoothed_v2 < reachable_smoothed_v2 {
                // It's possible for this move to accelerate
                if smoothed_v2 + smooth_delta_v2 > next_smoothed_v2 || !delayed.is_empty() {
                    // This move can decelerate or is a full accel move
                    // after a full decel move
                    if update_flush_count && peak_cruise_v2 > 0.0 {
                        flush_count = i;
                        update_flush_count = false;
                    }
                    peak_cruise_v2 =
                        max_cruise_v2.min((smoothed_v2 + reachable_smoothed_v2) * 0.5);
                    if !delayed.is_empty() {
                        if !update_flush_count && i < flush_count {
                            // Propagate peak_cruise_v2 to the delayed moves
                            let mut mc_v2 = peak_cruise_v2;
                            for &(j, ms_v2, me_v2) in delayed.iter().rev() {
                                mc_v2 = mc_v2.min(ms_v2);
                                self.queue[j].set_junction(
                                    ms_v2.min(mc_v2),
                                    mc_v2,
                                    me_v2.min(mc_v2),
                                );
                            }
                        }
                        delayed.clear();
                    }
                }
                if !update_flush_count && i < flush_count {
                    let cruise_v2 = ((start_v2 + reachable_start_v2) * 0.5)
                        .min(max_cruise_v2)
                        .min(peak_cruise_v2);
                    self.queue[i].set_junction(
                        start_v2.min(cruise_v2),
                        cruise_v2,
                        next_end_v2.min(cruise_v2),
                    );
                }
            } else {
                // Delay this move until peak_cruise_v2 is known
                delayed.push((i, start_v2, next_end_v2));
            }
            next_end_v2 = start_v2;
            next_smoothed_v2 = smoothed_v2;
        }
        if update_flush_count || flush_count == 0 {
            return Vec::new();
        }
        tracing::trace!(
            flushed = flush_count,
            retained = self.queue.len() - flush_count,
            lazy,
            "lookahead flush"
        );
        self.queue.drain(..flush_count).collect()
    }
}

impl Default for MoveQueue {
    fn default() -> Self {
        Self::new()
    }
}
