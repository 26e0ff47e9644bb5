use thiserror::Error;

use crate::device::{DeviceSummary, State};
use crate::registry::DeviceHandle;
use crate::wire::{CommandAck, DataFrame};
use crate::CommandToken;

/// Events of interest to the application
///
/// Every cross-component happening surfaces here: discovery results, lifecycle
/// transitions, command completions, and decoded stream frames. The driving layer
/// drains these after each datagram or timeout and dispatches them to client
/// callbacks in order.
#[derive(Debug)]
pub enum Event {
    /// A device announced itself and was added to the registry
    DeviceFound {
        /// Registry handle, stable until `DeviceRemoved`
        handle: DeviceHandle,
        /// Identity and address at discovery time
        summary: DeviceSummary,
    },
    /// A device moved through the lifecycle state machine
    StateChanged {
        /// The device that transitioned
        handle: DeviceHandle,
        /// State before the transition
        old: State,
        /// State after the transition
        new: State,
    },
    /// A device was declared lost and disconnected
    ///
    /// Always accompanied by a `StateChanged` into `Disconnected`.
    DeviceLost {
        /// The device that was lost
        handle: DeviceHandle,
        /// What liveness signal failed
        reason: LostReason,
    },
    /// A disconnected device's registry entry was dropped
    ///
    /// The handle is dead after this; a re-announcing device gets a fresh one.
    DeviceRemoved {
        /// The dropped handle
        handle: DeviceHandle,
    },
    /// A client command reached its terminal outcome
    ///
    /// Exactly one of these is emitted per accepted `send_command` call. An
    /// acknowledgement with nonzero status still completes the command; the status
    /// is the device's answer, not a transport failure.
    CommandComplete {
        /// The device the command was sent to
        handle: DeviceHandle,
        /// Tag supplied at submission
        token: CommandToken,
        /// The acknowledgement, or why none will come
        result: Result<CommandAck, CommandError>,
    },
    /// A point stream frame arrived for a sampling device
    Frame {
        /// The sampling device
        handle: DeviceHandle,
        /// The decoded frame
        frame: DataFrame,
    },
    /// A start sampling request was not accepted by the device
    ///
    /// The device stays in `Connected`.
    SamplingRejected {
        /// The device that declined or timed out
        handle: DeviceHandle,
        /// Why sampling did not start
        error: CommandError,
    },
}

/// Why a device was declared lost
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LostReason {
    /// Announcements stopped arriving for long enough
    AnnouncementsStopped,
    /// Consecutive keepalive probes went unanswered
    KeepaliveTimeout,
    /// No valid stream frame arrived within the liveness window
    DataStalled,
    /// The handshake retry budget was exhausted
    HandshakeFailed,
}

/// Terminal failure of a command request
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// No acknowledgement arrived within the retry budget
    #[error("command timed out")]
    TimedOut,
    /// The device answered with a nonzero status
    #[error("device rejected command with status {0}")]
    Rejected(u8),
    /// The request was dropped by disconnect or shutdown before completion
    #[error("command cancelled")]
    Cancelled,
    /// The device was lost while the request was outstanding
    #[error("device lost")]
    DeviceLost,
}
