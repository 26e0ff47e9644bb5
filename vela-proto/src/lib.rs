//! Low-level protocol logic for the Vela LiDAR device protocol
//!
//! vela-proto contains a fully deterministic implementation of the host side of the
//! protocol: broadcast discovery, sequence-numbered command exchange with retry, and
//! point stream decoding. It contains no networking code and does not get any
//! relevant timestamps from the operating system. Most users may want to use the
//! socket-driving vela API instead.
//!
//! The most important type is `Endpoint`, which holds the protocol state for every
//! known device, dispatches incoming datagrams to the related per-device state
//! machines, and yields outgoing datagrams, application events, and the next timer
//! deadline through its poll methods.

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]
// Fixes welcome:
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::too_many_arguments)]

use std::net::SocketAddr;
use std::time::Duration;

mod config;
pub use crate::config::{Config, ConfigError};

mod device;
pub use crate::device::{DataStats, DeviceSummary, SessionParams, State};

mod discovery;

mod endpoint;
pub use crate::endpoint::{
    ConnectError, Endpoint, EndpointStats, HostPorts, SamplingError, SendError,
};

mod event;
pub use crate::event::{CommandError, Event, LostReason};

mod registry;
pub use crate::registry::DeviceHandle;

#[cfg(test)]
mod tests;
mod timer;

pub mod wire;
pub use crate::wire::{
    Announcement, Capabilities, CartesianPoint, CommandAck, DataFrame, DeviceId, DeviceKind,
    FirmwareVersion, PointFormat, Points, SphericalPoint, WireError,
};

/// An outgoing datagram
///
/// The host only ever transmits on command lanes; announcements and point stream
/// frames are inbound-only.
#[derive(Debug)]
pub struct Transmit {
    /// The device whose command socket should carry this datagram
    pub handle: DeviceHandle,
    /// The socket address this datagram should be sent to
    pub destination: SocketAddr,
    /// Contents of the datagram
    pub contents: Box<[u8]>,
}

/// Opaque tag correlating a client-issued command with its completion event
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CommandToken(#[doc(hidden)] pub u64);

//
// Useful internal constants
//

/// Largest exponent the retry backoff factor is ever raised to
const MAX_BACKOFF_EXPONENT: u32 = 16;
/// Sequence number the first command on a fresh lane carries
const INITIAL_SEQ: u16 = 1;
/// Most unacknowledged commands one device will hold before refusing more
const MAX_PENDING_COMMANDS: usize = 256;
/// Upper bound on a single command attempt's timeout; longer waits are clamped
const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(60 * 60);
