use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::registry::DeviceHandle;

/// Announcement recency tracking for every registered device
///
/// The endpoint owns the announcement socket and the registry; this only
/// remembers when each device last announced and decides when silence means
/// the device is gone.
#[derive(Debug)]
pub(crate) struct Discovery {
    enabled: bool,
    seen: FxHashMap<DeviceHandle, Instant>,
}

impl Discovery {
    pub(crate) fn new() -> Self {
        Self {
            enabled: true,
            seen: FxHashMap::default(),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Resume reacting to announcements; idempotent
    pub(crate) fn start(&mut self) {
        if !self.enabled {
            trace!("discovery started");
        }
        self.enabled = true;
    }

    /// Stop reacting to announcements; idempotent
    ///
    /// Recency tracking freezes with it, so devices are not declared lost
    /// merely because nobody is listening. Session-level liveness still runs.
    pub(crate) fn stop(&mut self) {
        if self.enabled {
            trace!("discovery stopped");
        }
        self.enabled = false;
    }

    pub(crate) fn observe(&mut self, handle: DeviceHandle, now: Instant) {
        self.seen.insert(handle, now);
    }

    pub(crate) fn forget(&mut self, handle: DeviceHandle) {
        self.seen.remove(&handle);
    }

    /// Drain devices that have been silent for `lost_after` or longer
    ///
    /// Drained handles stop being tracked until the device announces again, so
    /// each silence is reported once.
    pub(crate) fn sweep(&mut self, now: Instant, lost_after: Duration) -> Vec<DeviceHandle> {
        if !self.enabled {
            return Vec::new();
        }
        let stale = self
            .seen
            .iter()
            .filter(|&(_, &last)| now.duration_since(last) >= lost_after)
            .map(|(&handle, _)| handle)
            .collect::<Vec<_>>();
        for handle in &stale {
            self.seen.remove(handle);
        }
        stale
    }

    /// Earliest instant at which a tracked device could cross the loss threshold
    pub(crate) fn next_deadline(&self, lost_after: Duration) -> Option<Instant> {
        if !self.enabled {
            return None;
        }
        self.seen.values().min().map(|&last| last + lost_after)
    }
}
