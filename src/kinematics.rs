// src/kinematics.rs
//! Kinematics seam consulted for per-move validation.

use serde::Serialize;

use crate::error::CommandError;
use crate::motion::Move;

/// Homing and bounds snapshot reported through the status object.
#[derive(Debug, Clone, Serialize)]
pub struct KinStatus {
    pub homed_axes: String,
    pub axis_minimum: [f64; 3],
    pub axis_maximum: [f64; 3],
}

/// Geometry checks and homing state for one machine topology.
pub trait Kinematics {
    /// Validate a move's endpoint and apply axis speed limits.
    fn check_move(&self, m: &mut Move) -> Result<(), CommandError>;

    /// Force the logical position; axes listed in `homing_axes` become
    /// homed.
    fn set_position(&mut self, newpos: [f64; 4], homing_axes: &[usize]);

    /// Current per-axis position limits. Un-homed axes report an inverted
    /// `(1.0, -1.0)` range.
    fn limits(&self) -> [(f64, f64); 3];

    fn get_status(&self, eventtime: f64) -> KinStatus;
}

/// Straight-through cartesian topology.
pub struct CartesianKinematics {
    axis_ranges: [(f64, f64); 3],
    limits: [(f64, f64); 3],
    max_z_velocity: f64,
    max_z_accel: f64,
}

impl CartesianKinematics {
    pub fn new(axis_ranges: [(f64, f64); 3], max_z_velocity: f64, max_z_accel: f64) -> Self {
        Self {
            axis_ranges,
            limits: [(1.0, -1.0); 3],
            max_z_velocity,
            max_z_accel,
        }
    }

    fn check_endstops(&self, m: &Move) -> Result<(), CommandError> {
        let end_pos = m.end_pos;
        for i in 0..3 {
            if m.axes_d[i] != 0.0
                && (end_pos[i] < self.limits[i].0 || end_pos[i] > self.limits[i].1)
            {
                if self.limits[i].0 > self.limits[i].1 {
                    return Err(CommandError::MustHomeFirst);
                }
                return Err(CommandError::MoveOutOfRange {
                    x: end_pos[0],
                    y: end_pos[1],
                    z: end_pos[2],
                    e: end_pos[3],
                    axis: Some(i),
                });
            }
        }
        Ok(())
    }
}

impl Kinematics for CartesianKinematics {
    fn check_move(&self, m: &mut Move) -> Result<(), CommandError> {
        let xpos = m.end_pos[0];
        let ypos = m.end_pos[1];
        if xpos < self.limits[0].0
            || xpos > self.limits[0].1
            || ypos < self.limits[1].0
            || ypos > self.limits[1].1
        {
            self.check_endstops(m)?;
        }
        if m.axes_d[2] == 0.0 {
            return Ok(());
        }
        // Move with Z - update velocity and accel for slower Z axis
        self.check_endstops(m)?;
        let z_ratio = m.move_d / m.axes_d[2].abs();
        m.limit_speed(self.max_z_velocity * z_ratio, self.max_z_accel * z_ratio);
        Ok(())
    }

    fn set_position(&mut self, _newpos: [f64; 4], homing_axes: &[usize]) {
        for &axis in homing_axes {
            if axis < 3 {
                self.limits[axis] = self.axis_ranges[axis];
                tracing::debug!(axis, "axis homed");
            }
        }
    }

    fn limits(&self) -> [(f64, f64); 3] {
        self.limits
    }

    fn get_status(&self, _eventtime: f64) -> KinStatus {
        let mut homed_axes = String::new();
        for (i, name) in ["x", "y", "z"].iter().enumerate() {
            if self.limits[i].0 <= self.limits[i].1 {
                homed_axes.push_str(name);
            }
        }
        KinStatus {
            homed_axes,
            axis_minimum: [
                self.axis_ranges[0].0,
                self.axis_ranges[1].0,
                self.axis_ranges[2].0,
            ],
            axis_maximum: [
                self.axis_ranges[0].1,
                self.axis_ranges[1].1,
                self.axis_ranges[2].1,
            ],
        }
    }
}
