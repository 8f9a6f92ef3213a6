// src/events.rs
//! Notifications emitted by the toolhead for other printer objects.

/// Events broadcast by the toolhead to interested subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolheadEvent {
    /// `print_time` was rebased after an idle period.
    SyncPrintTime {
        eventtime: f64,
        est_print_time: f64,
        print_time: f64,
    },
    /// The logical position was force-set (homing, probe offsets).
    SetPosition,
    /// A manual (partial-coordinate) move was accepted.
    ManualMove,
    /// The coordinator entered controlled shutdown.
    Shutdown { reason: String },
}

/// Synchronous single-threaded event fan-out.
///
/// Subscribers run inline on the emitting call; the coordinator has no
/// cross-task event traffic.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Box<dyn Fn(&ToolheadEvent)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F: Fn(&ToolheadEvent) + 'static>(&mut self, handler: F) {
        self.subscribers.push(Box::new(handler));
    }

    pub fn emit(&self, event: &ToolheadEvent) {
        tracing::trace!(?event, "toolhead event");
        for handler in &self.subscribers {
            handler(event);
        }
    }
}
