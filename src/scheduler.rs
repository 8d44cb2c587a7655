//! Composition coalescing
//!
//! The scheduler decides how many composite passes run between display
//! refreshes. It is a three state machine driven from two sides: `render()`
//! from any thread that changed something, and `presented()` from the output's
//! vsync callback.
//!
//! ```text
//!            render()                 render()
//!   Idle ─────────────► Presenting ─────────────► Pending
//!    ▲                    │    ▲                    │
//!    └────── vsync ───────┘    └────── vsync ───────┘
//! ```
//!
//! Any number of `render()` calls during a pass collapse into at most one
//! follow-up pass, and a change arriving mid-pass always gets one.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, trace};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No pass in flight
    Idle = 0,
    /// A pass is running or waiting for its vsync
    Presenting = 1,
    /// Like `Presenting`, and another pass is owed after the vsync
    Pending = 2,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SchedulerState::Presenting,
            2 => SchedulerState::Pending,
            _ => SchedulerState::Idle,
        }
    }
}

#[derive(Debug, Default)]
struct TriggerState {
    fired: bool,
    stopped: bool,
}

/// Wakes the presenter thread; at most one wake is ever outstanding
#[derive(Debug, Default)]
pub struct Trigger {
    state: Mutex<TriggerState>,
    condvar: Condvar,
}

impl Trigger {
    fn fire(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.fired = true;
        self.condvar.notify_one();
    }

    /// Block until fired (returns true) or stopped (returns false)
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !state.fired && !state.stopped {
            state = self.condvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        if state.stopped {
            return false;
        }
        state.fired = false;
        true
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stopped = true;
        self.condvar.notify_all();
    }
}

#[derive(Debug)]
pub struct FrameScheduler {
    state: AtomicU8,
    trigger: Arc<Trigger>,
    passes: AtomicU64,
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SchedulerState::Idle as u8),
            trigger: Arc::new(Trigger::default()),
            passes: AtomicU64::new(0),
        }
    }

    pub fn trigger(&self) -> Arc<Trigger> {
        Arc::clone(&self.trigger)
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of composite passes scheduled so far
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    fn transition(&self, from: SchedulerState, to: SchedulerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn schedule_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.trigger.fire();
    }

    /// Something changed; make sure a pass will show it
    pub fn render(&self) {
        if self.transition(SchedulerState::Presenting, SchedulerState::Pending) {
            trace!("Scheduler: Presenting -> Pending");
        } else if self.transition(SchedulerState::Idle, SchedulerState::Presenting) {
            trace!("Scheduler: Idle -> Presenting");
            self.schedule_pass();
        } else {
            // Already Pending: the owed pass will pick this change up.
            trace!("Scheduler: render absorbed");
        }
    }

    /// The frame of the last pass is on screen. Returns true when a follow-up
    /// pass was scheduled.
    pub fn presented(&self) -> bool {
        if self.transition(SchedulerState::Presenting, SchedulerState::Idle) {
            trace!("Scheduler: Presenting -> Idle");
            false
        } else if self.transition(SchedulerState::Pending, SchedulerState::Presenting) {
            trace!("Scheduler: Pending -> Presenting");
            self.schedule_pass();
            true
        } else {
            debug!("Scheduler: vsync while idle, ignored");
            false
        }
    }
}
