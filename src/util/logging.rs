//! # Throttled Logging
//!
//! A small rate limiter for log statements on hot paths. Framers see every
//! byte of line noise on a busy serial port; without throttling a single
//! unplugged dongle can flood the log.

use std::time::{Duration, Instant};

/// Windowed throttle: at most `max_events` log events per `window`.
#[derive(Debug)]
pub struct LogThrottle {
    window: Duration,
    max_events: u32,
    window_start: Instant,
    events_in_window: u32,
}

impl LogThrottle {
    pub fn new(window_millis: u64, max_events: u32) -> Self {
        LogThrottle {
            window: Duration::from_millis(window_millis),
            max_events,
            window_start: Instant::now(),
            events_in_window: 0,
        }
    }

    /// Returns true if the caller may log now.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) > self.window {
            self.window_start = now;
            self.events_in_window = 0;
        }
        if self.events_in_window < self.max_events {
            self.events_in_window += 1;
            true
        } else {
            false
        }
    }
}
