//! Tick-driven transaction timers.
//!
//! The engine has no notion of wall clock time. Every processing cycle counts as one tick, and
//! timer durations given in seconds are converted with the configured ticks per second.
use core::fmt::Debug;

/// Generic abstraction for a check/countdown timer. Should also be cheap to copy and clone.
pub trait CountdownProvider: Debug {
    fn has_expired(&self) -> bool;
    fn reset(&mut self);
}

/// Countdown which expires after a fixed number of ticks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TickTimer {
    remaining: u32,
    expiry_ticks: u32,
}

impl TickTimer {
    pub fn new(expiry_ticks: u32) -> Self {
        Self {
            remaining: expiry_ticks,
            expiry_ticks,
        }
    }

    /// Convert a duration in seconds. A zero duration yields a timer which expires on the first
    /// tick.
    pub fn from_seconds(seconds: u32, ticks_per_second: u32) -> Self {
        Self::new(seconds.saturating_mul(ticks_per_second))
    }

    /// Advance by one tick.
    #[inline]
    pub fn tick(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }

    #[inline]
    pub fn remaining_ticks(&self) -> u32 {
        self.remaining
    }

    #[inline]
    pub fn expiry_ticks(&self) -> u32 {
        self.expiry_ticks
    }
}

impl CountdownProvider for TickTimer {
    #[inline]
    fn has_expired(&self) -> bool {
        self.remaining == 0
    }

    #[inline]
    fn reset(&mut self) {
        self.remaining = self.expiry_ticks;
    }
}
