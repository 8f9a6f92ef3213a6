// src/zpos.rs
//! Persistence of the last commanded Z position.
//!
//! Survives restarts so a resumed print can recover its layer height. The
//! file is rewritten only on meaningful changes and only from the reactor
//! thread; write failures are logged, never surfaced as command errors.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Minimum Z change (mm) before the file is rewritten.
const Z_RECORD_THRESHOLD: f64 = 5.0;

#[derive(Debug, Serialize, Deserialize)]
struct ZPosRecord {
    z_pos: f64,
}

pub struct ZPosRecorder {
    path: PathBuf,
    z_pos: f64,
}

impl ZPosRecorder {
    /// Open the recorder, reading any existing record. A missing or
    /// corrupt file starts the position at zero.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let z_pos = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<ZPosRecord>(&contents) {
                Ok(record) => record.z_pos,
                Err(err) => {
                    tracing::error!(path = %path.display(), %err, "bad z_pos record");
                    0.0
                }
            },
            Err(_) => 0.0,
        };
        Self { path, z_pos }
    }

    pub fn last(&self) -> f64 {
        self.z_pos
    }

    /// Persist `z` when it moved more than the recording threshold. The
    /// caller is responsible for the homed-Z gate.
    pub fn record(&mut self, z: f64) {
        if (z - self.z_pos).abs() <= Z_RECORD_THRESHOLD {
            return;
        }
        self.z_pos = z;
        match serde_json::to_string(&ZPosRecord { z_pos: z }) {
            Ok(body) => {
                if let Err(err) = fs::write(&self.path, body) {
                    tracing::error!(path = %self.path.display(), %err, "z_pos write failed");
                } else {
                    tracing::info!(z_pos = z, "recorded z position");
                }
            }
            Err(err) => tracing::error!(%err, "z_pos encode failed"),
        }
    }
}
