//! # Duplicate Suppression and Warning Throttling
//!
//! Radio telegrams are repeated by meters and relayed by repeaters, so
//! the same frame regularly arrives more than once, sometimes through
//! two dongles at the same time. A short FIFO of SHA-256 frame hashes
//! suppresses those repeats.
//!
//! Warnings about undecryptable meters are throttled the same way: the
//! first telegram from a meter prints its warnings, later ones stay
//! silent (unless verbose logging asks for everything).

use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// Hashes of the most recently seen telegram frames.
const SEEN_TELEGRAMS_CAP: usize = 10;

/// Meters we have warned about, keyed by id+version+type.
const WARNED_METERS_CAP: usize = 100;

/// Bounded FIFO of frame hashes.
#[derive(Debug, Default)]
pub struct DedupFifo {
    seen: VecDeque<[u8; 32]>,
}

impl DedupFifo {
    pub fn new() -> Self {
        DedupFifo::default()
    }

    /// Record `frame` and report whether it was already present.
    ///
    /// The FIFO keeps the last ten unique frames; the eleventh unique
    /// frame evicts the first.
    pub fn seen_before(&mut self, frame: &[u8]) -> bool {
        let hash: [u8; 32] = Sha256::digest(frame).into();

        if self.seen.contains(&hash) {
            return true;
        }
        if self.seen.len() >= SEEN_TELEGRAMS_CAP {
            self.seen.pop_front();
        }
        self.seen.push_back(hash);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Bounded FIFO of meter identities (4 id bytes + version + type) that
/// already triggered a warning.
#[derive(Debug, Default)]
pub struct WarningThrottle {
    warned: VecDeque<[u8; 6]>,
}

impl WarningThrottle {
    pub fn new() -> Self {
        WarningThrottle::default()
    }

    /// Decide whether a warning for the meter identified by `dll_a` may
    /// be printed.
    ///
    /// The telegram that triggers the first warning for a meter sets
    /// `triggered_warning`, which keeps all of its own follow-up
    /// warnings printable; subsequent telegrams from the same meter are
    /// throttled.
    pub fn should_warn(&mut self, dll_a: [u8; 6], triggered_warning: &mut bool) -> bool {
        if self.warned.contains(&dll_a) {
            return *triggered_warning;
        }
        if self.warned.len() >= WARNED_METERS_CAP {
            self.warned.pop_front();
        }
        self.warned.push_back(dll_a);
        *triggered_warning = true;
        true
    }
}
