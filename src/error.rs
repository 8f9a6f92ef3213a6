// src/error.rs
use thiserror::Error;

/// Structured command failures surfaced to the gcode layer.
///
/// Each variant carries a stable error key from the firmware error catalog
/// (where one exists) and a human-readable message. `structured()` renders
/// the same `{"code","msg","values"}` JSON the firmware emits.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("Must home axis first")]
    MustHomeFirst,

    #[error("Move out of range: {x:.3} {y:.3} {z:.3} [{e:.3}]")]
    MoveOutOfRange { x: f64, y: f64, z: f64, e: f64, axis: Option<usize> },

    #[error(
        "Extrude below minimum temp\nSee the 'min_extrude_temp' config option for details"
    )]
    ExtrudeBelowMinTemp,

    #[error("Extrude only move too long ({distance:.3}mm vs {max:.3}mm)")]
    ExtrudeOnlyTooLong { distance: f64, max: f64 },

    #[error(
        "Move exceeds maximum extrusion ({area:.3}mm^2 vs {max_area:.3}mm^2)\nSee the 'max_extrude_cross_section' config option for details"
    )]
    ExtrudeExceedsMaxCrossSection { area: f64, max_area: f64 },

    #[error("Extrude when no extruder present")]
    NoExtruder,

    #[error("Invalid M204 command \"{commandline}\"")]
    InvalidCommand { commandline: String },
}

impl CommandError {
    /// Stable firmware error key, when the catalog defines one.
    pub fn key(&self) -> Option<&'static str> {
        match self {
            CommandError::MoveOutOfRange { axis, .. } => Some(match axis {
                Some(0) => "key585",
                Some(1) => "key586",
                Some(2) => "key587",
                _ => "key243",
            }),
            CommandError::ExtrudeBelowMinTemp => Some("key111"),
            CommandError::ExtrudeExceedsMaxCrossSection { .. } => Some("key112"),
            CommandError::InvalidCommand { .. } => Some("key73"),
            _ => None,
        }
    }

    /// Render the `{"code","msg","values"}` form used on the wire.
    pub fn structured(&self) -> serde_json::Value {
        let values = match self {
            CommandError::MoveOutOfRange { x, y, z, e, .. } => {
                serde_json::json!([x, y, z, e])
            }
            CommandError::ExtrudeOnlyTooLong { distance, max } => {
                serde_json::json!([distance, max])
            }
            CommandError::ExtrudeExceedsMaxCrossSection { area, max_area } => {
                serde_json::json!([area, max_area])
            }
            CommandError::InvalidCommand { commandline } => {
                serde_json::json!([commandline])
            }
            _ => serde_json::json!([]),
        };
        serde_json::json!({
            "code": self.key().unwrap_or(""),
            "msg": self.to_string(),
            "values": values,
        })
    }
}

/// Top-level toolhead failure type.
#[derive(Debug, Error)]
pub enum ToolheadError {
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Control-flow signal: the active drip move was cancelled at a segment
    /// boundary. Raised only while in drip state and caught inside
    /// `ToolHead::drip_move`; it never escapes to callers.
    #[error("drip move ended")]
    DripEnd,
}
