// src/config.rs
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level printer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printer: PrinterConfig,

    #[serde(default)]
    pub extruder: ExtruderConfig,

    /// Optional acceleration caps applied while Qmode is active.
    #[serde(default)]
    pub qmode: Option<QmodeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            printer: PrinterConfig::default(),
            extruder: ExtruderConfig::default(),
            qmode: None,
        }
    }
}

/// Motion limits and buffering behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default = "default_kinematics")]
    pub kinematics: String,

    #[serde(default = "default_max_velocity")]
    pub max_velocity: f64,

    #[serde(default = "default_max_accel")]
    pub max_accel: f64,

    /// Defaults to half of max_accel when unset.
    #[serde(default)]
    pub max_accel_to_decel: Option<f64>,

    #[serde(default = "default_square_corner_velocity")]
    pub square_corner_velocity: f64,

    #[serde(default = "default_square_corner_max_velocity")]
    pub square_corner_max_velocity: f64,

    #[serde(default = "default_buffer_time_low")]
    pub buffer_time_low: f64,

    #[serde(default = "default_buffer_time_high")]
    pub buffer_time_high: f64,

    #[serde(default = "default_buffer_time_start")]
    pub buffer_time_start: f64,

    #[serde(default = "default_move_flush_time")]
    pub move_flush_time: f64,

    #[serde(default = "default_max_z_velocity")]
    pub max_z_velocity: f64,

    #[serde(default = "default_max_z_accel")]
    pub max_z_accel: f64,

    #[serde(default)]
    pub position_min: [f64; 3],

    #[serde(default = "default_position_max")]
    pub position_max: [f64; 3],

    /// Where to persist the last commanded Z; persistence is disabled
    /// when unset.
    #[serde(default)]
    pub z_pos_file: Option<String>,
}

impl PrinterConfig {
    /// `max_accel_to_decel` with its derived default applied.
    pub fn accel_to_decel(&self) -> f64 {
        self.max_accel_to_decel.unwrap_or(self.max_accel * 0.5)
    }
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            kinematics: default_kinematics(),
            max_velocity: default_max_velocity(),
            max_accel: default_max_accel(),
            max_accel_to_decel: None,
            square_corner_velocity: default_square_corner_velocity(),
            square_corner_max_velocity: default_square_corner_max_velocity(),
            buffer_time_low: default_buffer_time_low(),
            buffer_time_high: default_buffer_time_high(),
            buffer_time_start: default_buffer_time_start(),
            move_flush_time: default_move_flush_time(),
            max_z_velocity: default_max_z_velocity(),
            max_z_accel: default_max_z_accel(),
            position_min: [0.0; 3],
            position_max: default_position_max(),
            z_pos_file: None,
        }
    }
}

/// Extruder geometry and extrusion limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtruderConfig {
    #[serde(default = "default_extruder_name")]
    pub name: String,

    #[serde(default = "default_nozzle_diameter")]
    pub nozzle_diameter: f64,

    #[serde(default = "default_filament_diameter")]
    pub filament_diameter: f64,

    /// Defaults to 4 * nozzle_diameter^2 when unset.
    #[serde(default)]
    pub max_extrude_cross_section: Option<f64>,

    #[serde(default = "default_max_extrude_only_distance")]
    pub max_extrude_only_distance: f64,

    #[serde(default)]
    pub max_extrude_only_velocity: Option<f64>,

    #[serde(default)]
    pub max_extrude_only_accel: Option<f64>,

    #[serde(default = "default_instant_corner_velocity")]
    pub instant_corner_velocity: f64,

    #[serde(default = "default_min_extrude_temp")]
    pub min_extrude_temp: f64,
}

impl Default for ExtruderConfig {
    fn default() -> Self {
        Self {
            name: default_extruder_name(),
            nozzle_diameter: default_nozzle_diameter(),
            filament_diameter: default_filament_diameter(),
            max_extrude_cross_section: None,
            max_extrude_only_distance: default_max_extrude_only_distance(),
            max_extrude_only_velocity: None,
            max_extrude_only_accel: None,
            instant_corner_velocity: default_instant_corner_velocity(),
            min_extrude_temp: default_min_extrude_temp(),
        }
    }
}

/// Acceleration ceilings for quiet-mode printing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QmodeConfig {
    pub max_accel: f64,
    pub max_accel_to_decel: f64,
}

fn default_kinematics() -> String {
    "cartesian".to_string()
}
fn default_max_velocity() -> f64 {
    300.0
}
fn default_max_accel() -> f64 {
    3000.0
}
fn default_square_corner_velocity() -> f64 {
    5.0
}
fn default_square_corner_max_velocity() -> f64 {
    200.0
}
fn default_buffer_time_low() -> f64 {
    1.0
}
fn default_buffer_time_high() -> f64 {
    2.0
}
fn default_buffer_time_start() -> f64 {
    0.25
}
fn default_move_flush_time() -> f64 {
    0.050
}
fn default_max_z_velocity() -> f64 {
    5.0
}
fn default_max_z_accel() -> f64 {
    100.0
}
fn default_position_max() -> [f64; 3] {
    [235.0, 235.0, 250.0]
}
fn default_extruder_name() -> String {
    "extruder".to_string()
}
fn default_nozzle_diameter() -> f64 {
    0.4
}
fn default_filament_diameter() -> f64 {
    1.75
}
fn default_max_extrude_only_distance() -> f64 {
    50.0
}
fn default_instant_corner_velocity() -> f64 {
    1.0
}
fn default_min_extrude_temp() -> f64 {
    170.0
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!(path, "loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.printer;
        let require = |ok: bool, msg: &str| {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid(msg.to_string()))
            }
        };
        require(p.max_velocity > 0.0, "max_velocity must be above 0")?;
        require(p.max_accel > 0.0, "max_accel must be above 0")?;
        require(p.accel_to_decel() > 0.0, "max_accel_to_decel must be above 0")?;
        require(
            p.square_corner_velocity >= 0.0,
            "square_corner_velocity must not be negative",
        )?;
        require(
            p.square_corner_max_velocity >= 0.0,
            "square_corner_max_velocity must not be negative",
        )?;
        require(p.buffer_time_low > 0.0, "buffer_time_low must be above 0")?;
        require(
            p.buffer_time_high > p.buffer_time_low,
            "buffer_time_high must be above buffer_time_low",
        )?;
        require(p.buffer_time_start > 0.0, "buffer_time_start must be above 0")?;
        require(p.move_flush_time > 0.0, "move_flush_time must be above 0")?;
        require(p.max_z_velocity > 0.0, "max_z_velocity must be above 0")?;
        require(p.max_z_accel > 0.0, "max_z_accel must be above 0")?;
        for i in 0..3 {
            require(
                p.position_min[i] <= p.position_max[i],
                "position_min must not exceed position_max",
            )?;
        }
        let e = &self.extruder;
        require(e.nozzle_diameter > 0.0, "nozzle_diameter must be above 0")?;
        require(e.filament_diameter > 0.0, "filament_diameter must be above 0")?;
        require(
            e.max_extrude_only_distance > 0.0,
            "max_extrude_only_distance must be above 0",
        )?;
        if let Some(q) = &self.qmode {
            require(q.max_accel > 0.0, "qmode max_accel must be above 0")?;
            require(
                q.max_accel_to_decel > 0.0,
                "qmode max_accel_to_decel must be above 0",
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn accel_to_decel_defaults_to_half() {
        let config = Config::default();
        assert_eq!(
            config.printer.accel_to_decel(),
            config.printer.max_accel * 0.5
        );
    }

    #[test]
    fn toml_round_trip() {
        let raw = r#"
            [printer]
            max_velocity = 250.0
            max_accel = 4000.0
            square_corner_velocity = 8.0

            [extruder]
            nozzle_diameter = 0.6

            [qmode]
            max_accel = 2000.0
            max_accel_to_decel = 1000.0
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.printer.max_velocity, 250.0);
        assert_eq!(config.printer.buffer_time_high, 2.0);
        assert_eq!(config.extruder.nozzle_diameter, 0.6);
        assert_eq!(config.qmode.unwrap().max_accel, 2000.0);
    }

    #[test]
    fn inverted_buffer_marks_rejected() {
        let mut config = Config::default();
        config.printer.buffer_time_high = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn nonpositive_velocity_rejected() {
        let mut config = Config::default();
        config.printer.max_velocity = 0.0;
        assert!(config.validate().is_err());
    }
}
