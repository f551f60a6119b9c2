//! Frame handshake between one simulation thread and the render thread
//!
//! Two flags under one mutex and one condvar. The simulation side publishes a
//! frame and then waits, without a deadline, for the render side to finish
//! with it. The render side waits for a published frame but only up to a
//! timeout; on timeout it renders whatever state it has (a stale frame).
//!
//! Every transition and every wake-up happens with the mutex held, so a
//! notification can never fall between a waiter's check and its wait.

use lockstep_core::sync::MutexExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug)]
struct Flags {
    frame_ready: bool,
    render_complete: bool,
}

/// Outcome of the render side's wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameWait {
    /// A new frame was published and has been consumed.
    Fresh,
    /// Timed out; render the previous state.
    Stale,
    /// The instance stopped while waiting.
    Stopped,
}

#[derive(Debug)]
pub struct Handshake {
    flags: Mutex<Flags>,
    cv: Condvar,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    /// The first simulation step may run immediately.
    pub fn new() -> Self {
        Self {
            flags: Mutex::new(Flags {
                frame_ready: false,
                render_complete: true,
            }),
            cv: Condvar::new(),
        }
    }

    /// Simulation side: block until the previous frame was rendered.
    /// Returns `false` if `running` was cleared instead.
    pub fn wait_render_complete(&self, running: &AtomicBool) -> bool {
        let flags = self.flags.lock_or_recover();
        let _flags = self
            .cv
            .wait_while(flags, |f| !f.render_complete && running.load(Ordering::Acquire))
            .unwrap_or_else(PoisonError::into_inner);
        running.load(Ordering::Acquire)
    }

    /// Simulation side: hand the new frame to the render thread.
    pub fn publish_frame(&self) {
        let mut flags = self.flags.lock_or_recover();
        flags.frame_ready = true;
        flags.render_complete = false;
        self.cv.notify_all();
    }

    /// Render side: wait up to `timeout` for a published frame.
    pub fn wait_frame_ready(&self, running: &AtomicBool, timeout: Duration) -> FrameWait {
        let flags = self.flags.lock_or_recover();
        let (mut flags, result) = self
            .cv
            .wait_timeout_while(flags, timeout, |f| {
                !f.frame_ready && running.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);

        if !running.load(Ordering::Acquire) {
            return FrameWait::Stopped;
        }
        if result.timed_out() && !flags.frame_ready {
            return FrameWait::Stale;
        }
        flags.frame_ready = false;
        FrameWait::Fresh
    }

    /// Render side: release the simulation thread for its next step.
    pub fn complete_render(&self) {
        let mut flags = self.flags.lock_or_recover();
        flags.render_complete = true;
        self.cv.notify_all();
    }

    /// Wake every waiter so it re-checks `running`.
    pub fn wake_all(&self) {
        let _flags = self.flags.lock_or_recover();
        self.cv.notify_all();
    }

    /// Back to the initial state, for a restart after a stop.
    pub fn reset(&self) {
        let mut flags = self.flags.lock_or_recover();
        flags.frame_ready = false;
        flags.render_complete = true;
    }
}
