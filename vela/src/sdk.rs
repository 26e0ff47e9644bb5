use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proto::wire::{self, ANNOUNCE_PORT};
use proto::{
    CommandAck, CommandError, Config, ConfigError, DataFrame, DeviceHandle, DeviceSummary,
    LostReason, State,
};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::runtime::{EventLoop, Inner};

/// Callback receiving every device lifecycle notification
pub(crate) type EventHandler = Box<dyn FnMut(DeviceEvent) + Send>;

/// Callback receiving decoded stream frames for one device
pub(crate) type FrameConsumer = Box<dyn FnMut(DataFrame) + Send>;

/// Outcome delivered to a command callback
pub type CommandResult = Result<CommandAck, CommandFailure>;

type CommandCallback = Box<dyn FnOnce(CommandResult) + Send>;

/// Notification delivered to the registered event handler
///
/// Command completions and stream frames go to their own per-request
/// callbacks and do not appear here.
#[derive(Debug)]
pub enum DeviceEvent {
    /// A device announced itself for the first time
    Found {
        /// Registry handle, stable until `Removed`
        handle: DeviceHandle,
        /// Identity and address at discovery time
        summary: DeviceSummary,
    },
    /// A device moved through its lifecycle
    StateChanged {
        /// The device that transitioned
        handle: DeviceHandle,
        /// State before the transition
        old: State,
        /// State after the transition
        new: State,
    },
    /// A device was declared lost and its session torn down
    Lost {
        /// The device that was lost
        handle: DeviceHandle,
        /// What liveness signal failed
        reason: LostReason,
    },
    /// A lost device's registry entry was dropped
    Removed {
        /// The dead handle
        handle: DeviceHandle,
    },
    /// A start sampling request was declined or went unanswered
    SamplingRejected {
        /// The device, still connected
        handle: DeviceHandle,
        /// Why sampling did not start
        error: CommandError,
    },
}

/// Why a command produced no acknowledgement
#[derive(Debug, Error)]
pub enum CommandFailure {
    /// The handle does not name a live device
    #[error("unknown device")]
    UnknownDevice,
    /// The device was not in a state that accepts commands
    #[error("device not connected, state {0:?}")]
    NotConnected(State),
    /// The body does not fit in a single command datagram
    #[error("command body over {} bytes", wire::MAX_COMMAND_BODY)]
    TooLarge,
    /// The device already holds its limit of unacknowledged commands
    #[error("command backlog full")]
    Backlogged,
    /// The SDK was shut down before the command could be issued
    #[error("sdk is shut down")]
    Closed,
    /// The protocol gave up on the command
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl From<proto::SendError> for CommandFailure {
    fn from(e: proto::SendError) -> Self {
        match e {
            proto::SendError::UnknownDevice => Self::UnknownDevice,
            proto::SendError::NotConnected(state) => Self::NotConnected(state),
            proto::SendError::TooLarge => Self::TooLarge,
            proto::SendError::Backlogged => Self::Backlogged,
        }
    }
}

/// Exactly-once wrapper around a command callback
///
/// Fires with the delivered result, or with `Closed` when dropped unfired,
/// wherever that drop happens.
pub(crate) struct Completion(Option<CommandCallback>);

impl Completion {
    fn new(callback: CommandCallback) -> Self {
        Self(Some(callback))
    }

    pub(crate) fn complete(mut self, result: CommandResult) {
        if let Some(callback) = self.0.take() {
            callback(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback(Err(CommandFailure::Closed));
        }
    }
}

/// Errors from [`Sdk::init`]
#[derive(Debug, Error)]
pub enum InitError {
    /// The configuration failed validation
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Binding the announcement socket or starting the I/O thread failed
    #[error("event loop setup: {0}")]
    Io(#[from] io::Error),
}

/// Errors from [`Sdk::start`]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    /// Discovery was already started
    #[error("already started")]
    AlreadyStarted,
    /// The SDK was already shut down
    #[error("sdk is shut down")]
    Closed,
}

/// The I/O thread has quit and can take no further requests
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("sdk is shut down")]
pub struct ClosedError;

/// Handle to a running SDK instance
///
/// [`init`](Self::init) spawns a dedicated I/O thread owning every socket and
/// all protocol state. Requests post onto that thread and return quickly;
/// results come back through callbacks, invoked one at a time and in order.
/// Callbacks must not block and must not call [`devices`](Self::devices).
///
/// Dropping the handle shuts the instance down.
#[derive(Debug)]
pub struct Sdk {
    event_loop: EventLoop,
    announce_addr: SocketAddr,
    started: bool,
}

impl Sdk {
    /// Validate `config` and spawn the I/O thread
    ///
    /// The announcement listener binds UDP port 56000, but announcements are
    /// ignored until [`start`](Self::start).
    pub fn init(config: Config) -> Result<Self, InitError> {
        Self::init_on(config, ANNOUNCE_PORT)
    }

    /// Like [`init`](Self::init), listening for announcements on `port`
    ///
    /// Port 0 binds an ephemeral port; [`announce_addr`](Self::announce_addr)
    /// reports which.
    pub fn init_on(config: Config, port: u16) -> Result<Self, InitError> {
        config.validate()?;
        let (event_loop, announce_addr) = EventLoop::spawn(Arc::new(config), port)?;
        Ok(Self {
            event_loop,
            announce_addr,
            started: false,
        })
    }

    /// Local address of the announcement listener
    pub fn announce_addr(&self) -> SocketAddr {
        self.announce_addr
    }

    /// Begin reacting to device announcements
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.started {
            return Err(StartError::AlreadyStarted);
        }
        self.event_loop
            .post(Box::new(|inner: &mut Inner| inner.start_discovery()))
            .map_err(|_| StartError::Closed)?;
        self.started = true;
        Ok(())
    }

    /// Register the callback receiving [`DeviceEvent`]s
    ///
    /// Replaces any previous handler. Events raised before a handler exists
    /// are logged and dropped.
    pub fn set_event_handler(
        &self,
        handler: impl FnMut(DeviceEvent) + Send + 'static,
    ) -> Result<(), ClosedError> {
        let handler: EventHandler = Box::new(handler);
        self.event_loop
            .post(Box::new(move |inner: &mut Inner| inner.set_handler(handler)))
    }

    /// Snapshot of every device currently known
    ///
    /// Blocks until the I/O thread replies; empty once the SDK is shut down.
    /// Calling this from inside a callback deadlocks.
    pub fn devices(&self) -> Vec<(DeviceHandle, DeviceSummary)> {
        let (reply, answer) = oneshot::channel();
        let posted = self.event_loop.post(Box::new(move |inner: &mut Inner| {
            let _ = reply.send(inner.devices());
        }));
        if posted.is_err() {
            return Vec::new();
        }
        answer.blocking_recv().unwrap_or_default()
    }

    /// Open a session with a discovered device
    ///
    /// Only needed when automatic connection is disabled in [`Config`].
    /// Progress surfaces as [`DeviceEvent::StateChanged`] through the event
    /// handler; a refused request is logged and produces no transition.
    pub fn connect(&self, handle: DeviceHandle) -> Result<(), ClosedError> {
        self.event_loop
            .post(Box::new(move |inner: &mut Inner| inner.request_connect(handle)))
    }

    /// End a device's session
    ///
    /// Outstanding commands complete with `Cancelled`. The device can be
    /// connected again once it re-announces.
    pub fn disconnect(&self, handle: DeviceHandle) -> Result<(), ClosedError> {
        self.event_loop
            .post(Box::new(move |inner: &mut Inner| inner.disconnect(handle)))
    }

    /// Send a command to a connected device
    ///
    /// `on_complete` is invoked exactly once with the acknowledgement or the
    /// reason none will come: on the I/O thread for accepted requests, or
    /// inline when the SDK is already shut down. `timeout` overrides the
    /// configured per-attempt timeout. An acknowledgement with nonzero status
    /// completes successfully; the status is the device's answer.
    pub fn send_command(
        &self,
        handle: DeviceHandle,
        code: u16,
        body: Bytes,
        timeout: Option<Duration>,
        on_complete: impl FnOnce(CommandResult) + Send + 'static,
    ) {
        let completion = Completion::new(Box::new(on_complete));
        let _ = self.event_loop.post(Box::new(move |inner: &mut Inner| {
            inner.send_command(handle, code, body, timeout, completion);
        }));
    }

    /// Ask a connected device to stream points into `on_frame`
    ///
    /// Acceptance surfaces as a transition into `Sampling`, refusal as
    /// [`DeviceEvent::SamplingRejected`].
    pub fn start_sampling(
        &self,
        handle: DeviceHandle,
        on_frame: impl FnMut(DataFrame) + Send + 'static,
    ) -> Result<(), ClosedError> {
        let consumer: FrameConsumer = Box::new(on_frame);
        self.event_loop.post(Box::new(move |inner: &mut Inner| {
            inner.start_sampling(handle, consumer)
        }))
    }

    /// Stop a sampling device's stream and end its session
    pub fn stop_sampling(&self, handle: DeviceHandle) -> Result<(), ClosedError> {
        self.event_loop
            .post(Box::new(move |inner: &mut Inner| inner.stop_sampling(handle)))
    }

    /// Tear every session down and stop the I/O thread; idempotent
    ///
    /// Devices get parting disconnect notices, outstanding commands complete
    /// with `Cancelled`, and callbacks see the final transitions before this
    /// returns. Dropping the handle does the same.
    pub fn shutdown(&mut self) {
        self.started = false;
        self.event_loop.shutdown();
    }
}
