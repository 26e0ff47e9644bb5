use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::Config;
use crate::device::{Device, DeviceSummary, State};
use crate::discovery::Discovery;
use crate::event::Event;
use crate::registry::{DeviceHandle, Registry};
use crate::wire;
use crate::{CommandToken, Transmit};

/// The main entry point to the library
///
/// An endpoint holds the protocol state of every known device and is driven
/// exclusively through explicit calls: incoming datagrams go in through the
/// `handle_*_datagram` methods, time advances through `handle_timeout`, and
/// the consequences come back out of `poll_transmit`, `poll_event`, and
/// `poll_timeout`. No method blocks or touches a socket.
#[derive(Debug)]
pub struct Endpoint {
    registry: Registry,
    discovery: Discovery,
    queues: Queues,
    config: Arc<Config>,
    stats: EndpointStats,
    next_token: u64,
}

impl Endpoint {
    /// Create an endpoint with no known devices
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            registry: Registry::default(),
            discovery: Discovery::new(),
            queues: Queues::default(),
            config,
            stats: EndpointStats::default(),
            next_token: 0,
        }
    }

    /// Process a datagram received on the announcement socket
    ///
    /// Returns the handle of the announcing device, fresh or existing, unless
    /// the datagram was dropped or discovery is stopped.
    pub fn handle_discovery_datagram(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        datagram: &[u8],
    ) -> Option<DeviceHandle> {
        if !self.discovery.is_enabled() {
            trace!(%remote, "announcement ignored while discovery is stopped");
            return None;
        }
        let announcement = match wire::decode(datagram) {
            Ok(wire::Message::Announce(announcement)) => announcement,
            Ok(_) => {
                self.stats.bad_announcements += 1;
                debug!(%remote, "non-announcement datagram on the discovery socket");
                return None;
            }
            Err(e) => {
                self.stats.bad_announcements += 1;
                debug!(%remote, error = %e, "undecodable announcement");
                return None;
            }
        };
        self.stats.announcements += 1;
        match self.registry.handle_of(&announcement.serial) {
            Some(handle) => {
                let device = &mut self.registry[handle];
                device.refresh(
                    handle,
                    now,
                    &announcement,
                    remote.ip(),
                    &self.config,
                    &mut self.queues,
                );
                self.discovery.observe(handle, now);
                Some(handle)
            }
            None => {
                let device = Device::new(&announcement, remote.ip());
                let summary = device.summary();
                let handle = self.registry.insert(device);
                self.discovery.observe(handle, now);
                self.stats.devices_seen += 1;
                debug!(
                    device = %summary.serial,
                    model = %summary.model,
                    address = %summary.address,
                    "device discovered"
                );
                self.queues.events.push_back(Event::DeviceFound { handle, summary });
                Some(handle)
            }
        }
    }

    /// Process a datagram received on `handle`'s command socket
    pub fn handle_command_datagram(
        &mut self,
        now: Instant,
        handle: DeviceHandle,
        remote: SocketAddr,
        datagram: &[u8],
    ) {
        let Some(device) = self.registry.get_mut(handle) else {
            trace!(?handle, "command datagram for dead handle");
            return;
        };
        device.handle_command_datagram(
            handle,
            now,
            &self.config,
            remote,
            datagram,
            &mut self.queues,
        );
    }

    /// Process a datagram received on `handle`'s data socket
    pub fn handle_data_datagram(
        &mut self,
        now: Instant,
        handle: DeviceHandle,
        remote: SocketAddr,
        datagram: &[u8],
    ) {
        let Some(device) = self.registry.get_mut(handle) else {
            trace!(?handle, "stream frame for dead handle");
            return;
        };
        device.handle_data_datagram(handle, now, &self.config, remote, datagram, &mut self.queues);
    }

    /// Process timer expirations up to `now`
    ///
    /// Call whenever the deadline from `poll_timeout` passes.
    pub fn handle_timeout(&mut self, now: Instant) {
        for handle in self.discovery.sweep(now, self.config.lost_after()) {
            if let Some(device) = self.registry.get_mut(handle) {
                debug!(device = %device.serial(), "announcements stopped");
                device.on_discovery_lost(handle, now, &self.config, &mut self.queues);
            }
        }
        for handle in self.registry.handles() {
            let Some(device) = self.registry.get_mut(handle) else {
                continue;
            };
            if device.handle_timeout(handle, now, &self.config, &mut self.queues) {
                let device = self.registry.remove(handle);
                self.discovery.forget(handle);
                debug!(device = %device.serial(), "registry entry pruned");
                self.queues.events.push_back(Event::DeviceRemoved { handle });
            }
        }
    }

    /// The instant `handle_timeout` next needs to run, over all devices
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        self.discovery
            .next_deadline(self.config.lost_after())
            .into_iter()
            .chain(
                self.registry
                    .iter()
                    .filter_map(|(_, device)| device.next_timeout()),
            )
            .min()
    }

    /// Next datagram to put on the wire
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.queues.transmits.pop_front()
    }

    /// Next application event
    pub fn poll_event(&mut self) -> Option<Event> {
        self.queues.events.pop_front()
    }

    /// Resume processing announcements; idempotent
    pub fn start_discovery(&mut self) {
        self.discovery.start();
    }

    /// Ignore announcements until `start_discovery`; idempotent
    ///
    /// Loss detection through announcement silence freezes too. Connected
    /// devices keep their session-level liveness checks.
    pub fn stop_discovery(&mut self) {
        self.discovery.stop();
    }

    /// Open a session with a discovered device
    ///
    /// `host` names the sockets the caller has already bound for this device;
    /// the handshake tells the device where to send acknowledgements and
    /// stream frames.
    pub fn connect(
        &mut self,
        now: Instant,
        handle: DeviceHandle,
        host: HostPorts,
    ) -> Result<(), ConnectError> {
        let device = self
            .registry
            .get_mut(handle)
            .ok_or(ConnectError::UnknownDevice)?;
        device.begin_connect(handle, now, &self.config, host, &mut self.queues)
    }

    /// End a device's session, cancelling whatever is outstanding
    pub fn disconnect(&mut self, now: Instant, handle: DeviceHandle) -> Result<(), ConnectError> {
        let device = self
            .registry
            .get_mut(handle)
            .ok_or(ConnectError::UnknownDevice)?;
        device.disconnect(handle, now, &self.config, &mut self.queues)
    }

    /// Send a command to a connected device
    ///
    /// Completion arrives later as `Event::CommandComplete` carrying the
    /// returned token. `timeout` overrides the configured per-attempt timeout;
    /// overrides longer than an hour are clamped to it.
    pub fn send_command(
        &mut self,
        now: Instant,
        handle: DeviceHandle,
        code: u16,
        body: Bytes,
        timeout: Option<Duration>,
    ) -> Result<CommandToken, SendError> {
        let device = self
            .registry
            .get_mut(handle)
            .ok_or(SendError::UnknownDevice)?;
        let token = CommandToken(self.next_token);
        device.send_command(
            handle,
            now,
            &self.config,
            code,
            body,
            timeout,
            token,
            &mut self.queues,
        )?;
        self.next_token += 1;
        self.stats.commands_issued += 1;
        Ok(token)
    }

    /// Ask a connected device to start streaming points
    ///
    /// The `Sampling` transition happens when the device acknowledges;
    /// refusal or timeout surfaces as `Event::SamplingRejected`.
    pub fn start_sampling(
        &mut self,
        now: Instant,
        handle: DeviceHandle,
    ) -> Result<(), SamplingError> {
        let device = self
            .registry
            .get_mut(handle)
            .ok_or(SamplingError::UnknownDevice)?;
        device.start_sampling(handle, now, &self.config, &mut self.queues)
    }

    /// Stop a sampling device's stream and end its session
    pub fn stop_sampling(
        &mut self,
        now: Instant,
        handle: DeviceHandle,
    ) -> Result<(), SamplingError> {
        let device = self
            .registry
            .get_mut(handle)
            .ok_or(SamplingError::UnknownDevice)?;
        device.stop_sampling(handle, now, &self.config, &mut self.queues)
    }

    /// Wind the endpoint down: stop discovery and end every active session
    ///
    /// Outstanding client commands complete with `CommandError::Cancelled`.
    /// Idempotent; the caller drains remaining transmits and events afterwards.
    pub fn shutdown(&mut self, now: Instant) {
        debug!("endpoint shutting down");
        self.discovery.stop();
        for handle in self.registry.handles() {
            if let Some(device) = self.registry.get_mut(handle) {
                device.shutdown(handle, now, &self.config, &mut self.queues);
            }
        }
    }

    /// Snapshot of one device, if the handle is live
    pub fn device(&self, handle: DeviceHandle) -> Option<DeviceSummary> {
        self.registry.get(handle).map(Device::summary)
    }

    /// Snapshot of every registered device
    pub fn devices(&self) -> Vec<(DeviceHandle, DeviceSummary)> {
        self.registry
            .iter()
            .map(|(handle, device)| (handle, device.summary()))
            .collect()
    }

    /// Cumulative counters over this endpoint's lifetime
    pub fn stats(&self) -> EndpointStats {
        self.stats
    }

    #[cfg(test)]
    pub(crate) fn device_inner(&self, handle: DeviceHandle) -> Option<&Device> {
        self.registry.get(handle)
    }
}

/// Outgoing datagrams and application events awaiting collection
#[derive(Debug, Default)]
pub(crate) struct Queues {
    pub(crate) transmits: VecDeque<Transmit>,
    pub(crate) events: VecDeque<Event>,
}

/// Host-side socket addressing handed to the device during the handshake
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HostPorts {
    /// IPv4 address the device should send to
    pub ip: Ipv4Addr,
    /// Destination port for command acknowledgements
    pub cmd_port: u16,
    /// Destination port for point stream frames
    pub data_port: u16,
}

/// Errors from session open and close requests
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The handle does not name a registered device
    #[error("unknown device")]
    UnknownDevice,
    /// The device's lifecycle state does not allow the request
    #[error("invalid device state: {0:?}")]
    InvalidState(State),
}

/// Errors from `Endpoint::send_command`
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The handle does not name a registered device
    #[error("unknown device")]
    UnknownDevice,
    /// Commands require an established session
    #[error("device not connected: {0:?}")]
    NotConnected(State),
    /// The body does not fit in a single command datagram
    #[error("command body over {} bytes", wire::MAX_COMMAND_BODY)]
    TooLarge,
    /// The device already holds its limit of unacknowledged commands
    #[error("command backlog full")]
    Backlogged,
}

/// Errors from sampling start and stop requests
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum SamplingError {
    /// The handle does not name a registered device
    #[error("unknown device")]
    UnknownDevice,
    /// The device's lifecycle state does not allow the request
    #[error("invalid device state: {0:?}")]
    InvalidState(State),
    /// A start request is already awaiting the device's answer
    #[error("sampling start already pending")]
    RequestPending,
}

/// Cumulative counters over an endpoint's lifetime
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct EndpointStats {
    /// Announcements accepted, new device or refresh
    pub announcements: u64,
    /// Datagrams on the discovery socket that were dropped
    pub bad_announcements: u64,
    /// Devices ever added to the registry
    pub devices_seen: u64,
    /// Client commands accepted for transmission
    pub commands_issued: u64,
}
