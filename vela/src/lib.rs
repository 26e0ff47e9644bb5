//! Vela: a LiDAR sensor SDK
//!
//! This crate provides discovery, session management, command channels, and
//! point stream delivery for Vela LiDAR devices, backed by a dedicated I/O
//! thread. [`Sdk::init`] spawns that thread; devices announcing themselves on
//! the local network then surface through the registered event handler, and
//! their point streams through per-device frame callbacks.
//!
//! All protocol logic lives in the sans-I/O [`proto`] crate, re-exported
//! here; this crate adds the sockets, the clock, and the callback plumbing.

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod runtime;
mod sdk;
mod socket;

pub use proto::{
    self, wire, Capabilities, CartesianPoint, CommandAck, CommandError, Config, ConfigError,
    DataFrame, DataStats, DeviceHandle, DeviceId, DeviceKind, DeviceSummary, FirmwareVersion,
    LostReason, PointFormat, Points, SessionParams, SphericalPoint, State,
};

pub use crate::sdk::{
    ClosedError, CommandFailure, CommandResult, DeviceEvent, InitError, Sdk, StartError,
};
