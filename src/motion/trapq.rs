// src/motion/trapq.rs
//! Trapezoidal velocity segment queue.
//!
//! Stores the accel/cruise/decel segments emitted for each planned move,
//! keyed by print time. Step generators read active segments; finalized
//! segments migrate to a bounded history so diagnostics and tests can
//! replay a move after the fact.

use std::collections::VecDeque;

use crate::reactor::NEVER;

const HISTORY_LIMIT: usize = 1024;

/// XYZ coordinate on the print-time axis.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// One constant-acceleration segment of a trapezoid.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrapSegment {
    pub print_time: f64,
    pub move_t: f64,
    pub start_v: f64,
    pub half_accel: f64,
    pub start_pos: Coord,
    pub axes_r: Coord,
}

impl TrapSegment {
    /// Distance traveled `move_time` seconds into the segment.
    pub fn distance(&self, move_time: f64) -> f64 {
        (self.start_v + self.half_accel * move_time) * move_time
    }

    /// Position `move_time` seconds into the segment.
    pub fn coord_at(&self, move_time: f64) -> Coord {
        let dist = self.distance(move_time);
        Coord {
            x: self.start_pos.x + self.axes_r.x * dist,
            y: self.start_pos.y + self.axes_r.y * dist,
            z: self.start_pos.z + self.axes_r.z * dist,
        }
    }

    pub fn end_time(&self) -> f64 {
        self.print_time + self.move_t
    }
}

/// Time-ordered trapezoid segment store.
pub struct TrapQ {
    moves: VecDeque<TrapSegment>,
    history: VecDeque<TrapSegment>,
}

impl TrapQ {
    pub fn new() -> Self {
        Self {
            moves: VecDeque::new(),
            history: VecDeque::new(),
        }
    }

    /// Append the segments of one planned trapezoid starting at
    /// `print_time`. Zero-duration phases are elided.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        print_time: f64,
        accel_t: f64,
        cruise_t: f64,
        decel_t: f64,
        start_pos: Coord,
        axes_r: Coord,
        start_v: f64,
        cruise_v: f64,
        accel: f64,
    ) {
        let mut time = print_time;
        let mut pos = start_pos;
        if accel_t > 0.0 {
            let seg = TrapSegment {
                print_time: time,
                move_t: accel_t,
                start_v,
                half_accel: 0.5 * accel,
                start_pos: pos,
                axes_r,
            };
            pos = seg.coord_at(accel_t);
            time += accel_t;
            self.moves.push_back(seg);
        }
        if cruise_t > 0.0 {
            let seg = TrapSegment {
                print_time: time,
                move_t: cruise_t,
                start_v: cruise_v,
                half_accel: 0.0,
                start_pos: pos,
                axes_r,
            };
            pos = seg.coord_at(cruise_t);
            time += cruise_t;
            self.moves.push_back(seg);
        }
        if decel_t > 0.0 {
            let seg = TrapSegment {
                print_time: time,
                move_t: decel_t,
                start_v: cruise_v,
                half_accel: -0.5 * accel,
                start_pos: pos,
                axes_r,
            };
            self.moves.push_back(seg);
        }
    }

    /// Release segments ending at or before `free_time` into history.
    pub fn finalize_moves(&mut self, free_time: f64) {
        while let Some(front) = self.moves.front() {
            if front.end_time() > free_time {
                break;
            }
            let seg = *front;
            self.moves.pop_front();
            self.history.push_back(seg);
        }
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    /// Reseed the queue origin after a forced position change. All active
    /// segments are finalized first.
    pub fn set_position(&mut self, print_time: f64, pos: Coord) {
        self.finalize_moves(NEVER);
        self.moves.push_back(TrapSegment {
            print_time,
            move_t: 0.0,
            start_v: 0.0,
            half_accel: 0.0,
            start_pos: pos,
            axes_r: Coord::default(),
        });
    }

    pub fn active(&self) -> impl Iterator<Item = &TrapSegment> {
        self.moves.iter()
    }

    pub fn history(&self) -> impl Iterator<Item = &TrapSegment> {
        self.history.iter()
    }

    pub fn active_len(&self) -> usize {
        self.moves.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

impl Default for TrapQ {
    fn default() -> Self {
        Self::new()
    }
}
