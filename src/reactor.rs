// src/reactor.rs
//! Cooperative event-loop seam.
//!
//! The toolhead suspends itself through this trait: bounded pauses while
//! waiting for the MCU to drain, timer scheduling for the flush handler,
//! and completion waits during drip moves. Timer *dispatch* stays with the
//! reactor's owner: the driver loop polls `due_timers` and invokes the
//! component handler, which returns its next waketime.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

/// Timer waketime requesting dispatch on the next pass.
pub const NOW: f64 = 0.0;
/// Timer waketime meaning "never fire".
pub const NEVER: f64 = 9_999_999_999_999_999.9;

/// Opaque handle to a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(usize);

struct CompletionState {
    done: Cell<bool>,
    notify: Notify,
}

/// One-shot completion signal shared between a producer and a waiter.
///
/// Clones observe the same state. Completing twice is a no-op.
#[derive(Clone)]
pub struct Completion {
    state: Rc<CompletionState>,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            state: Rc::new(CompletionState {
                done: Cell::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn complete(&self) {
        if !self.state.done.replace(true) {
            self.state.notify.notify_waiters();
        }
    }

    pub fn test(&self) -> bool {
        self.state.done.get()
    }

    pub(crate) async fn notified(&self) {
        self.state.notify.notified().await;
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
pub trait Reactor {
    /// Monotonic event time in seconds.
    fn monotonic(&self) -> f64;

    /// Cooperatively yield until `waketime`; returns the current time.
    async fn pause(&self, waketime: f64) -> f64;

    fn register_timer(&self, waketime: f64) -> TimerHandle;
    fn update_timer(&self, timer: TimerHandle, waketime: f64);
    fn timer_waketime(&self, timer: TimerHandle) -> f64;

    /// Timers whose waketime has been reached at `eventtime`.
    fn due_timers(&self, eventtime: f64) -> Vec<TimerHandle>;

    /// Wait until `completion` is set or `waketime` passes; returns the
    /// current time.
    async fn wait_completion(&self, completion: &Completion, waketime: f64) -> f64;
}

fn due_handles(timers: &[f64], eventtime: f64) -> Vec<TimerHandle> {
    timers
        .iter()
        .enumerate()
        .filter(|&(_, &wake)| wake < NEVER && wake <= eventtime)
        .map(|(i, _)| TimerHandle(i))
        .collect()
}

/// Wall-clock reactor backed by tokio's timer wheel.
pub struct TokioReactor {
    epoch: Instant,
    timers: RefCell<Vec<f64>>,
}

impl TokioReactor {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            timers: RefCell::new(Vec::new()),
        }
    }
}

impl Default for TokioReactor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Reactor for TokioReactor {
    fn monotonic(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    async fn pause(&self, waketime: f64) -> f64 {
        let delay = waketime - self.monotonic();
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.monotonic()
    }

    fn register_timer(&self, waketime: f64) -> TimerHandle {
        let mut timers = self.timers.borrow_mut();
        timers.push(waketime);
        TimerHandle(timers.len() - 1)
    }

    fn update_timer(&self, timer: TimerHandle, waketime: f64) {
        self.timers.borrow_mut()[timer.0] = waketime;
    }

    fn timer_waketime(&self, timer: TimerHandle) -> f64 {
        self.timers.borrow()[timer.0]
    }

    fn due_timers(&self, eventtime: f64) -> Vec<TimerHandle> {
        due_handles(&self.timers.borrow(), eventtime)
    }

    async fn wait_completion(&self, completion: &Completion, waketime: f64) -> f64 {
        loop {
            if completion.test() {
                return self.monotonic();
            }
            let remaining = waketime - self.monotonic();
            if remaining <= 0.0 {
                return self.monotonic();
            }
            tokio::select! {
                _ = completion.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs_f64(remaining)) => {
                    return self.monotonic();
                }
            }
        }
    }
}

type ScheduledAction = (f64, Box<dyn FnOnce()>);

/// Deterministic virtual-clock reactor for tests and the demo harness.
///
/// `pause` advances the clock instantly, running any actions scheduled in
/// the skipped interval. Actions model external stimuli (an endstop
/// trigger completing a drip, an operator command) without real sleeps.
pub struct SimReactor {
    now: Cell<f64>,
    timers: RefCell<Vec<f64>>,
    actions: RefCell<Vec<ScheduledAction>>,
}

impl SimReactor {
    pub fn new() -> Self {
        Self {
            now: Cell::new(0.0),
            timers: RefCell::new(Vec::new()),
            actions: RefCell::new(Vec::new()),
        }
    }

    /// Schedule `action` to run when the virtual clock reaches `at`.
    pub fn schedule<F: FnOnce() + 'static>(&self, at: f64, action: F) {
        self.actions.borrow_mut().push((at, Box::new(action)));
    }

    fn pop_next_action(&self, upto: f64) -> Option<ScheduledAction> {
        let mut actions = self.actions.borrow_mut();
        let idx = actions
            .iter()
            .enumerate()
            .filter(|(_, (at, _))| *at <= upto)
            .min_by(|(_, (a, _)), (_, (b, _))| a.total_cmp(b))
            .map(|(i, _)| i)?;
        Some(actions.swap_remove(idx))
    }

    /// Advance the clock to `waketime`, running due actions in time order.
    pub fn advance_to(&self, waketime: f64) -> f64 {
        while let Some((at, action)) = self.pop_next_action(waketime) {
            self.now.set(self.now.get().max(at));
            action();
        }
        self.now.set(self.now.get().max(waketime));
        self.now.get()
    }
}

impl Default for SimReactor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Reactor for SimReactor {
    fn monotonic(&self) -> f64 {
        self.now.get()
    }

    async fn pause(&self, waketime: f64) -> f64 {
        self.advance_to(waketime)
    }

    fn register_timer(&self, waketime: f64) -> TimerHandle {
        let mut timers = self.timers.borrow_mut();
        timers.push(waketime);
        TimerHandle(timers.len() - 1)
    }

    fn update_timer(&self, timer: TimerHandle, waketime: f64) {
        self.timers.borrow_mut()[timer.0] = waketime;
    }

    fn timer_waketime(&self, timer: TimerHandle) -> f64 {
        self.timers.borrow()[timer.0]
    }

    fn due_timers(&self, eventtime: f64) -> Vec<TimerHandle> {
        due_handles(&self.timers.borrow(), eventtime)
    }

    async fn wait_completion(&self, completion: &Completion, waketime: f64) -> f64 {
        loop {
            if completion.test() {
                return self.now.get();
            }
            match self.pop_next_action(waketime) {
                Some((at, action)) => {
                    self.now.set(self.now.get().max(at));
                    action();
                }
                None => {
                    self.now.set(self.now.get().max(waketime));
                    return self.now.get();
                }
            }
        }
    }
}
