use std::time::Instant;

/// Cumulative point stream delivery counters for one device
///
/// Drops are counted, never fatal; a garbled frame costs one sample batch, a
/// closed stream would cost the session.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct DataStats {
    /// Frames decoded and delivered to the consumer
    pub frames: u64,
    /// Points across all delivered frames
    pub points: u64,
    /// Dropped: preamble damaged or checksum mismatch
    pub bad_header: u64,
    /// Dropped: datagram ended before the advertised points
    pub truncated: u64,
    /// Dropped: trailing bytes after the advertised points
    pub bad_length: u64,
    /// Dropped: unknown point encoding
    pub unknown_format: u64,
    /// Dropped: arrived while the device was not sampling
    pub not_sampling: u64,
    /// Dropped: source address was not the device's
    pub stale_source: u64,
    /// Dropped: non-stream datagram on the stream socket
    pub unexpected_family: u64,
}

/// Live state of one device's point stream session
///
/// Exists if and only if the device is in the `Sampling` state; creation and
/// destruction happen strictly inside lifecycle transitions.
#[derive(Debug)]
pub(crate) struct DataLane {
    /// When sampling started
    pub(crate) opened: Instant,
    /// Frames delivered this session
    pub(crate) frames: u64,
    /// Points delivered this session
    pub(crate) points: u64,
}

impl DataLane {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            opened: now,
            frames: 0,
            points: 0,
        }
    }
}
