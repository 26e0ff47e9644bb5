use std::time::Instant;

/// Kinds of timeouts needed to run the protocol logic
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Timer {
    /// When the earliest outstanding command retransmits or gives up
    CommandRetry = 0,
    /// When to probe the command lane with a keepalive
    Keepalive = 1,
    /// When to declare the point stream stalled
    DataLiveness = 2,
    /// When to drop a disconnected device from the registry
    Prune = 3,
}

impl Timer {
    pub(crate) const VALUES: [Self; 4] = [
        Self::CommandRetry,
        Self::Keepalive,
        Self::DataLiveness,
        Self::Prune,
    ];
}

/// A deadline slot for each distinct kind of `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; 4],
}

impl TimerTable {
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    pub(crate) fn stop_all(&mut self) {
        self.data = [None; 4];
    }

    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    pub(crate) fn is_expired(&self, timer: Timer, after: Instant) -> bool {
        self.data[timer as usize].is_some_and(|x| x <= after)
    }
}
