// src/extruder.rs
//! Extruder seam: junction coupling, extrusion validation, and the
//! extruder-axis trapezoid queue.

use std::f64::consts::PI;

use crate::config::ExtruderConfig;
use crate::error::CommandError;
use crate::motion::{Coord, Move, TrapQ};

pub trait Extruder {
    fn name(&self) -> &str;

    /// Squared velocity cap for the junction between `prev` and `m`,
    /// derived from the instantaneous extruder velocity change.
    fn calc_junction(&self, prev: &Move, m: &Move) -> f64;

    /// Validate a move with extruder displacement, tightening its speed
    /// limits where needed.
    fn check_move(&self, m: &mut Move) -> Result<(), CommandError>;

    /// Emit the extruder-axis trapezoid for a planned move.
    fn process_move(&mut self, print_time: f64, m: &Move);

    /// Release extruder segments scheduled before `flush_time`.
    fn update_move_time(&mut self, flush_time: f64);

    /// Filament position after the last processed move.
    fn last_position(&self) -> f64;
}

/// Placeholder used until a real extruder is configured.
pub struct DummyExtruder;

impl Extruder for DummyExtruder {
    fn name(&self) -> &str {
        ""
    }

    fn calc_junction(&self, _prev: &Move, m: &Move) -> f64 {
        m.max_cruise_v2
    }

    fn check_move(&self, _m: &mut Move) -> Result<(), CommandError> {
        Err(CommandError::NoExtruder)
    }

    fn process_move(&mut self, _print_time: f64, _m: &Move) {}

    fn update_move_time(&mut self, _flush_time: f64) {}

    fn last_position(&self) -> f64 {
        0.0
    }
}

/// Filament-driving extruder with its own trapezoid queue.
pub struct PrinterExtruder {
    name: String,
    trapq: TrapQ,
    last_position: f64,
    can_extrude: bool,
    instant_corner_v: f64,
    filament_area: f64,
    max_extrude_ratio: f64,
    max_e_velocity: f64,
    max_e_accel: f64,
    max_e_dist: f64,
    nozzle_diameter: f64,
}

impl PrinterExtruder {
    pub fn new(config: &ExtruderConfig, max_velocity: f64, max_accel: f64) -> Self {
        let filament_area = PI * (config.filament_diameter * 0.5).powi(2);
        let max_cross_section = config
            .max_extrude_cross_section
            .unwrap_or(4.0 * config.nozzle_diameter * config.nozzle_diameter);
        let max_extrude_ratio = max_cross_section / filament_area;
        tracing::info!(
            name = %config.name,
            max_extrude_ratio,
            "extruder configured"
        );
        Self {
            name: config.name.clone(),
            trapq: TrapQ::new(),
            last_position: 0.0,
            can_extrude: config.min_extrude_temp <= 0.0,
            instant_corner_v: config.instant_corner_velocity,
            filament_area,
            max_extrude_ratio,
            max_e_velocity: config
                .max_extrude_only_velocity
                .unwrap_or(max_velocity * max_extrude_ratio),
            max_e_accel: config
                .max_extrude_only_accel
                .unwrap_or(max_accel * max_extrude_ratio),
            max_e_dist: config.max_extrude_only_distance,
            nozzle_diameter: config.nozzle_diameter,
        }
    }

    /// Heater gate: extrusion is allowed only above the minimum extrude
    /// temperature. The heater itself lives behind this flag.
    pub fn set_can_extrude(&mut self, can_extrude: bool) {
        self.can_extrude = can_extrude;
    }

    pub fn trapq(&self) -> &TrapQ {
        &self.trapq
    }
}

impl Extruder for PrinterExtruder {
    fn name(&self) -> &str {
        &self.name
    }

    fn calc_junction(&self, prev: &Move, m: &Move) -> f64 {
        let diff_r = m.axes_r[3] - prev.axes_r[3];
        if diff_r != 0.0 {
            let v = self.instant_corner_v / diff_r.abs();
            return v * v;
        }
        m.max_cruise_v2
    }

    fn check_move(&self, m: &mut Move) -> Result<(), CommandError> {
        let axis_r = m.axes_r[3];
        if !self.can_extrude {
            return Err(CommandError::ExtrudeBelowMinTemp);
        }
        if m.axes_d[0] == 0.0 && m.axes_d[1] == 0.0 {
            // Extrude only move
            if m.axes_d[3].abs() > self.max_e_dist {
                return Err(CommandError::ExtrudeOnlyTooLong {
                    distance: m.axes_d[3].abs(),
                    max: self.max_e_dist,
                });
            }
            let inv_extrude_r = 1.0 / axis_r.abs();
            m.limit_speed(
                self.max_e_velocity * inv_extrude_r,
                self.max_e_accel * inv_extrude_r,
            );
        } else if axis_r > self.max_extrude_ratio {
            if m.axes_d[3] <= self.nozzle_diameter * self.max_extrude_ratio {
                // Permit extrusion if amount extruded is tiny
                return Ok(());
            }
            let area = axis_r * self.filament_area;
            tracing::debug!(
                area,
                move_d = m.move_d,
                axes_d3 = m.axes_d[3],
                "overextrude rejected"
            );
            return Err(CommandError::ExtrudeExceedsMaxCrossSection {
                area,
                max_area: self.max_extrude_ratio * self.filament_area,
            });
        }
        Ok(())
    }

    fn process_move(&mut self, print_time: f64, m: &Move) {
        let axis_r = m.axes_r[3];
        // Scale the trapezoid onto the extruder axis; retraction shows up
        // as negative velocities against a unit direction.
        self.trapq.append(
            print_time,
            m.accel_t,
            m.cruise_t,
            m.decel_t,
            Coord::new(m.start_pos[3], 0.0, 0.0),
            Coord::new(1.0, 0.0, 0.0),
            m.start_v * axis_r,
            m.cruise_v * axis_r,
            m.accel * axis_r,
        );
        self.last_position = m.end_pos[3];
    }

    fn update_move_time(&mut self, flush_time: f64) {
        self.trapq.finalize_moves(flush_time);
    }

    fn last_position(&self) -> f64 {
        self.last_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::PlannerLimits;

    fn limits() -> PlannerLimits {
        PlannerLimits {
            max_velocity: 100.0,
            max_accel: 1000.0,
            max_accel_to_decel: 500.0,
            junction_deviation: 0.01,
        }
    }

    fn extruder() -> PrinterExtruder {
        let mut config = ExtruderConfig::default();
        config.min_extrude_temp = 0.0;
        PrinterExtruder::new(&config, 100.0, 1000.0)
    }

    fn print_move(e_per_mm: f64) -> Move {
        Move::new(
            &limits(),
            [0.0, 0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0, 10.0 * e_per_mm],
            50.0,
        )
    }

    #[test]
    fn cold_extrusion_is_rejected() {
        let mut ext = extruder();
        ext.set_can_extrude(false);
        let mut m = print_move(0.05);
        assert_eq!(
            ext.check_move(&mut m),
            Err(CommandError::ExtrudeBelowMinTemp)
        );
    }

    #[test]
    fn normal_print_ratio_passes() {
        let ext = extruder();
        let mut m = print_move(0.05);
        assert!(ext.check_move(&mut m).is_ok());
    }

    #[test]
    fn overextrusion_is_rejected() {
        let ext = extruder();
        // Extrude ratio far past any sane cross-section
        let mut m = print_move(2.0);
        match ext.check_move(&mut m) {
            Err(CommandError::ExtrudeExceedsMaxCrossSection { area, max_area }) => {
                assert!(area > max_area);
            }
            other => panic!("expected cross-section error, got {other:?}"),
        }
    }

    #[test]
    fn long_extrude_only_move_is_rejected() {
        let ext = extruder();
        let mut m = Move::new(
            &limits(),
            [0.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 120.0],
            30.0,
        );
        assert!(matches!(
            ext.check_move(&mut m),
            Err(CommandError::ExtrudeOnlyTooLong { .. })
        ));
    }

    #[test]
    fn extrude_only_move_is_speed_limited() {
        let ext = extruder();
        let mut m = Move::new(
            &limits(),
            [0.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 10.0],
            500.0,
        );
        ext.check_move(&mut m).unwrap();
        let cap = ext.max_e_velocity;
        assert!((m.max_cruise_v2 - cap * cap).abs() < 1e-6);
    }

    #[test]
    fn junction_cap_follows_ratio_difference() {
        let ext = extruder();
        let prev = print_move(0.05);
        let mut cur = Move::new(
            &limits(),
            [10.0, 0.0, 0.0, 0.5],
            [20.0, 0.0, 0.0, 1.5],
            50.0,
        );
        cur.axes_r[3] = prev.axes_r[3]; // same ratio -> no extra cap
        assert_eq!(ext.calc_junction(&prev, &cur), cur.max_cruise_v2);
        cur.axes_r[3] = prev.axes_r[3] + 0.1;
        let v = ext.instant_corner_v / 0.1;
        assert!((ext.calc_junction(&prev, &cur) - v * v).abs() < 1e-9);
    }

    #[test]
    fn process_move_tracks_last_position() {
        let mut ext = extruder();
        let mut m = print_move(0.05);
        m.set_junction(0.0, 2500.0, 0.0);
        ext.process_move(1.0, &m);
        assert!((ext.last_position() - 0.5).abs() < 1e-12);
        assert!(ext.trapq().active_len() > 0);
    }
}
