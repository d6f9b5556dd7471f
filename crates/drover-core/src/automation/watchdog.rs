//! Blank-page watchdog.
//!
//! Pure observation logic: the controller feeds it render states and a
//! clock reading, and it says when the blank bound has been exceeded.
//! Keeping it free of I/O makes the recovery budget testable on its own.

use tokio::time::{Duration, Instant};

use super::surface::RenderState;

/// What the controller should do about the current render state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Keep waiting.
    Healthy,
    /// Blank for longer than the bound: force one reload.
    ForceReload,
    /// Blank again after the one allowed reload: give up.
    Fatal,
}

/// Tracks how long the surface has been continuously blank.
#[derive(Debug)]
pub struct BlankWatchdog {
    bound: Duration,
    blank_since: Option<Instant>,
    reloads_used: u32,
}

impl BlankWatchdog {
    pub fn new(bound: Duration) -> Self {
        Self {
            bound,
            blank_since: None,
            reloads_used: 0,
        }
    }

    /// Feeds one render-state observation taken at `now`.
    pub fn observe(&mut self, state: RenderState, now: Instant) -> WatchdogVerdict {
        match state {
            RenderState::Stable => {
                self.blank_since = None;
                self.reloads_used = 0;
                WatchdogVerdict::Healthy
            }
            RenderState::Loading => {
                // Loading is progress, not blankness.
                self.blank_since = None;
                WatchdogVerdict::Healthy
            }
            RenderState::Blank => {
                let since = *self.blank_since.get_or_insert(now);
                if now.duration_since(since) <= self.bound {
                    return WatchdogVerdict::Healthy;
                }
                if self.reloads_used == 0 {
                    self.reloads_used = 1;
                    self.blank_since = None;
                    WatchdogVerdict::ForceReload
                } else {
                    WatchdogVerdict::Fatal
                }
            }
        }
    }
}
