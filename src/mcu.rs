// src/mcu.rs
use std::cell::Cell;

/// Downstream microcontroller contract consumed by the toolhead.
///
/// The coordinator only needs a clock estimate and a flush valve; command
/// encoding and transport live behind this seam.
pub trait McuLink {
    /// Estimate of the print time the hardware has reached at `eventtime`.
    fn estimated_print_time(&self, eventtime: f64) -> f64;

    /// Transmit all queued step data scheduled before `flush_time`.
    fn flush_moves(&self, flush_time: f64);

    /// True when this link writes a capture file instead of real hardware;
    /// file output cannot be paced, so the toolhead never stalls on it.
    fn is_fileoutput(&self) -> bool {
        false
    }

    /// Periodic liveness check driven by the stats path.
    fn check_active(&self, _print_time: f64, _eventtime: f64) {}
}

/// Simulated MCU whose clock tracks host monotonic time one-to-one.
pub struct SimMcu {
    clock_offset: Cell<f64>,
    flushed_upto: Cell<f64>,
    fileoutput: bool,
}

impl SimMcu {
    pub fn new() -> Self {
        Self {
            clock_offset: Cell::new(0.0),
            flushed_upto: Cell::new(0.0),
            fileoutput: false,
        }
    }

    pub fn new_fileoutput() -> Self {
        Self {
            fileoutput: true,
            ..Self::new()
        }
    }

    /// Shift the simulated clock relative to host time. A positive offset
    /// makes the MCU appear to lag behind the host.
    pub fn set_clock_offset(&self, offset: f64) {
        self.clock_offset.set(offset);
    }

    /// High-water mark of flushed step data.
    pub fn flushed_upto(&self) -> f64 {
        self.flushed_upto.get()
    }
}

impl Default for SimMcu {
    fn default() -> Self {
        Self::new()
    }
}

impl McuLink for SimMcu {
    fn estimated_print_time(&self, eventtime: f64) -> f64 {
        eventtime - self.clock_offset.get()
    }

    fn flush_moves(&self, flush_time: f64) {
        let prev = self.flushed_upto.get();
        if flush_time > prev {
            self.flushed_upto.set(flush_time);
            tracing::trace!(flush_time, "mcu flush");
        }
    }

    fn is_fileoutput(&self) -> bool {
        self.fileoutput
    }

    fn check_active(&self, print_time: f64, eventtime: f64) {
        tracing::trace!(print_time, eventtime, "mcu check_active");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimated_print_time_follows_offset() {
        let mcu = SimMcu::new();
        assert_eq!(mcu.estimated_print_time(5.0), 5.0);
        mcu.set_clock_offset(2.0);
        assert_eq!(mcu.estimated_print_time(5.0), 3.0);
    }

    #[test]
    fn flush_moves_keeps_high_water_mark() {
        let mcu = SimMcu::new();
        mcu.flush_moves(1.0);
        mcu.flush_moves(0.5);
        assert_eq!(mcu.flushed_upto(), 1.0);
    }

    #[test]
    fn fileoutput_flag() {
        assert!(!SimMcu::new().is_fileoutput());
        assert!(SimMcu::new_fileoutput().is_fileoutput());
    }
}
