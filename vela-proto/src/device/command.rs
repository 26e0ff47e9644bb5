use std::cmp;
use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{CommandToken, INITIAL_SEQ, MAX_BACKOFF_EXPONENT};

/// Outstanding request bookkeeping for one device's command channel
///
/// Exists while the device is handshaking, connected, or sampling. Sequence
/// numbers are unique per device and never reused while a request with that
/// number is outstanding, so a late acknowledgement can never be attributed to
/// the wrong request.
#[derive(Debug)]
pub(crate) struct CommandLane {
    next_seq: u16,
    pending: FxHashMap<u16, PendingCommand>,
    /// Acknowledgements for unknown or retired sequence numbers
    pub(crate) stale_acks: u64,
    /// Undecodable datagrams received on the command socket
    pub(crate) decode_errors: u64,
}

/// A command awaiting acknowledgement, retry, or cancellation
#[derive(Debug)]
pub(crate) struct PendingCommand {
    pub(crate) code: u16,
    pub(crate) body: Bytes,
    /// First transmission time
    pub(crate) issued: Instant,
    pub(crate) deadline: Instant,
    pub(crate) base_timeout: Duration,
    /// Retransmissions so far
    pub(crate) attempt: u32,
    /// Retransmission budget
    pub(crate) retries: u32,
    pub(crate) origin: Origin,
}

/// Who asked for a command and where its outcome is routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Application request, completed through `Event::CommandComplete`
    Client(CommandToken),
    /// Session setup, owned by the lifecycle machine
    Handshake,
    /// Firmware query following a successful handshake
    DeviceInfo,
    /// Liveness probe on an otherwise idle lane
    Keepalive,
    /// Stream start on behalf of the application
    StartSampling,
}

/// What became of an acknowledgement arriving on the lane
pub(crate) enum AckDisposition {
    /// Matched and retired an outstanding request
    Completed(PendingCommand),
    /// Unknown or retired sequence, or code mismatch; dropped
    Stale,
}

/// Outcome of processing every deadline that has passed
#[derive(Debug, Default)]
pub(crate) struct DeadlineSweep {
    /// Requests to put on the wire again, deadlines already re-armed
    pub(crate) retransmit: Vec<u16>,
    /// Requests retired with their retry budget spent
    pub(crate) exhausted: Vec<(u16, PendingCommand)>,
}

impl CommandLane {
    pub(crate) fn new() -> Self {
        Self {
            next_seq: INITIAL_SEQ,
            pending: FxHashMap::default(),
            stale_acks: 0,
            decode_errors: 0,
        }
    }

    /// Register a request, returning the sequence number it will carry
    pub(crate) fn push(
        &mut self,
        now: Instant,
        code: u16,
        body: Bytes,
        timeout: Duration,
        retries: u32,
        origin: Origin,
    ) -> u16 {
        let seq = self.alloc_seq();
        self.pending.insert(
            seq,
            PendingCommand {
                code,
                body,
                issued: now,
                deadline: now + timeout,
                base_timeout: timeout,
                attempt: 0,
                retries,
                origin,
            },
        );
        seq
    }

    /// Next free sequence number, skipping any still outstanding
    ///
    /// Terminates because callers hold the pending table far below the 65536
    /// sequence values.
    fn alloc_seq(&mut self) -> u16 {
        debug_assert!(self.pending.len() < usize::from(u16::MAX));
        loop {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            if !self.pending.contains_key(&seq) {
                return seq;
            }
        }
    }

    /// Sequence number for a request that is sent once and never matched
    ///
    /// Used for fire-and-forget teardown commands; any acknowledgement that
    /// does come back counts as stale.
    pub(crate) fn alloc_untracked(&mut self) -> u16 {
        self.alloc_seq()
    }

    /// Match an acknowledgement against the pending table
    ///
    /// A sequence match with a different command code is treated as stale rather
    /// than completing the entry; the correlated request keeps waiting.
    pub(crate) fn match_ack(&mut self, seq: u16, code: u16) -> AckDisposition {
        match self.pending.entry(seq) {
            Entry::Occupied(entry) if entry.get().code == code => {
                AckDisposition::Completed(entry.remove())
            }
            _ => {
                self.stale_acks += 1;
                trace!(seq, code, "stale ack dropped");
                AckDisposition::Stale
            }
        }
    }

    /// Advance every request whose deadline has passed by one attempt
    pub(crate) fn handle_deadlines(&mut self, now: Instant, backoff_factor: u32) -> DeadlineSweep {
        let due: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&seq, _)| seq)
            .collect();
        let mut sweep = DeadlineSweep::default();
        for seq in due {
            match self.pending.entry(seq) {
                Entry::Vacant(_) => {}
                Entry::Occupied(mut entry) => {
                    if entry.get().attempt >= entry.get().retries {
                        sweep.exhausted.push((seq, entry.remove()));
                    } else {
                        let pending = entry.get_mut();
                        pending.attempt += 1;
                        pending.deadline = now
                            + retry_interval(pending.base_timeout, backoff_factor, pending.attempt);
                        sweep.retransmit.push(seq);
                    }
                }
            }
        }
        sweep
    }

    /// Encoded form of an outstanding request, for retransmission
    pub(crate) fn encoded(&self, seq: u16) -> Option<Box<[u8]>> {
        let pending = self.pending.get(&seq)?;
        Some(
            crate::wire::CommandRequest {
                code: pending.code,
                body: pending.body.clone(),
            }
            .encode(seq),
        )
    }

    /// Earliest pending deadline, if any
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Whether a request from the given origin is outstanding
    pub(crate) fn has_origin(&self, origin: Origin) -> bool {
        self.pending.values().any(|p| p.origin == origin)
    }

    /// Retire every outstanding request, in no particular order
    pub(crate) fn cancel_all(&mut self) -> Vec<PendingCommand> {
        self.pending.drain().map(|(_, p)| p).collect()
    }

    /// Requests awaiting acknowledgement or retry exhaustion
    pub(crate) fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

/// Wait before the given retransmission attempt
///
/// A factor of 1 keeps the interval constant; larger factors grow it
/// exponentially with the exponent capped so deadline arithmetic stays sane.
fn retry_interval(base: Duration, factor: u32, attempt: u32) -> Duration {
    if factor <= 1 {
        return base;
    }
    base * factor.saturating_pow(cmp::min(attempt, MAX_BACKOFF_EXPONENT))
}
