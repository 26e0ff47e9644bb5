use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::endpoint::{ConnectError, HostPorts, Queues, SamplingError, SendError};
use crate::event::{CommandError, Event, LostReason};
use crate::registry::DeviceHandle;
use crate::timer::{Timer, TimerTable};
use crate::wire::{
    self, codes, Announcement, Capabilities, CommandAck, DeviceId, DeviceKind, FirmwareVersion,
    HandshakeAck, HandshakeRequest, PointFormat,
};
use crate::{CommandToken, Transmit, MAX_COMMAND_TIMEOUT, MAX_PENDING_COMMANDS};

mod command;
mod data;

pub(crate) use command::{AckDisposition, CommandLane, Origin};
pub use data::DataStats;
pub(crate) use data::DataLane;

/// Connection lifecycle of a device
///
/// Transitions happen only inside this module, in reaction to discovery
/// observations, command outcomes, stream liveness, and explicit requests.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum State {
    /// Announced and registered; no session yet
    Discovered,
    /// Session handshake in flight
    Handshaking,
    /// Session established; command lane live
    Connected,
    /// Point stream flowing
    Sampling,
    /// Session over; quiescent until re-announcement or pruning
    Disconnected,
}

/// Session parameters negotiated during connection setup
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Protocol revision the session runs
    pub protocol: u8,
    /// Point encoding the device streams
    pub point_format: PointFormat,
    /// Firmware revision, filled in by the info query
    pub firmware: Option<FirmwareVersion>,
}

/// Point-in-time snapshot of one device
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    /// Hardware identity
    pub serial: DeviceId,
    /// Model family
    pub model: DeviceKind,
    /// Protocol revision from the latest announcement
    pub protocol: u8,
    /// Where the device accepts commands
    pub address: SocketAddr,
    /// Advertised capability bits
    pub capabilities: Capabilities,
    /// Lifecycle state at snapshot time
    pub state: State,
    /// Negotiated session, if any
    pub session: Option<SessionParams>,
    /// Stream delivery counters
    pub data_stats: DataStats,
}

/// Protocol state for one device
///
/// Channel state obeys the lifecycle: the command lane exists while
/// handshaking, connected, or sampling; the data lane exists strictly while
/// sampling.
#[derive(Debug)]
pub(crate) struct Device {
    serial: DeviceId,
    model: DeviceKind,
    protocol: u8,
    capabilities: Capabilities,
    addr: IpAddr,
    cmd_port: u16,

    state: State,
    session: Option<SessionParams>,
    timers: TimerTable,
    command: Option<CommandLane>,
    data: Option<DataLane>,
    host: Option<HostPorts>,
    /// Completed handshake command cycles this connection attempt
    handshake_cycles: u32,
    keepalive_misses: u32,
    stats: DataStats,
}

impl Device {
    pub(crate) fn new(announcement: &Announcement, remote_ip: IpAddr) -> Self {
        Self {
            serial: announcement.serial,
            model: announcement.model,
            protocol: announcement.protocol,
            capabilities: announcement.capabilities,
            addr: remote_ip,
            cmd_port: announcement.cmd_port,

            state: State::Discovered,
            session: None,
            timers: TimerTable::default(),
            command: None,
            data: None,
            host: None,
            handshake_cycles: 0,
            keepalive_misses: 0,
            stats: DataStats::default(),
        }
    }

    pub(crate) fn serial(&self) -> DeviceId {
        self.serial
    }

    pub(crate) fn cmd_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.cmd_port)
    }

    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    #[cfg(test)]
    pub(crate) fn command_lane_open(&self) -> bool {
        self.command.is_some()
    }

    #[cfg(test)]
    pub(crate) fn data_lane_open(&self) -> bool {
        self.data.is_some()
    }

    #[cfg(test)]
    pub(crate) fn outstanding_commands(&self) -> usize {
        self.command.as_ref().map_or(0, CommandLane::outstanding)
    }

    #[cfg(test)]
    pub(crate) fn stale_acks(&self) -> u64 {
        self.command.as_ref().map_or(0, |lane| lane.stale_acks)
    }

    pub(crate) fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            serial: self.serial,
            model: self.model,
            protocol: self.protocol,
            address: self.cmd_addr(),
            capabilities: self.capabilities,
            state: self.state,
            session: self.session,
            data_stats: self.stats,
        }
    }

    /// The single place `State` changes
    fn set_state(&mut self, handle: DeviceHandle, new: State, queues: &mut Queues) {
        use State::*;
        debug_assert!(matches!(
            (self.state, new),
            (Discovered, Handshaking)
                | (Discovered, Disconnected)
                | (Handshaking, Connected)
                | (Handshaking, Disconnected)
                | (Connected, Sampling)
                | (Connected, Disconnected)
                | (Sampling, Disconnected)
                | (Disconnected, Discovered)
        ));
        let old = self.state;
        self.state = new;
        trace!(device = %self.serial, ?old, ?new, "state transition");
        queues.events.push_back(Event::StateChanged { handle, old, new });
    }

    /// Fold a fresh announcement into identity and address state
    pub(crate) fn refresh(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        announcement: &Announcement,
        remote_ip: IpAddr,
        cfg: &Config,
        queues: &mut Queues,
    ) {
        self.capabilities = announcement.capabilities;
        self.protocol = announcement.protocol;
        if announcement.model != self.model {
            warn!(
                device = %self.serial,
                old = %self.model,
                new = %announcement.model,
                "device changed model between announcements"
            );
            self.model = announcement.model;
        }

        let moved = remote_ip != self.addr || announcement.cmd_port != self.cmd_port;
        if moved {
            debug!(
                device = %self.serial,
                from = %self.cmd_addr(),
                to = %SocketAddr::new(remote_ip, announcement.cmd_port),
                "device address changed"
            );
            if matches!(
                self.state,
                State::Handshaking | State::Connected | State::Sampling
            ) {
                // The session was negotiated against the old address
                warn!(device = %self.serial, "active device moved; tearing session down");
                self.teardown(handle, now, cfg, None, queues);
            }
            self.addr = remote_ip;
            self.cmd_port = announcement.cmd_port;
        }

        if self.state == State::Disconnected {
            self.timers.stop(Timer::Prune);
            self.set_state(handle, State::Discovered, queues);
        }
    }

    /// Start a session: bind the command lane and send the first handshake
    pub(crate) fn begin_connect(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        host: HostPorts,
        queues: &mut Queues,
    ) -> Result<(), ConnectError> {
        if self.state != State::Discovered {
            return Err(ConnectError::InvalidState(self.state));
        }
        self.host = Some(host);
        self.command = Some(CommandLane::new());
        self.handshake_cycles = 0;
        self.keepalive_misses = 0;
        self.set_state(handle, State::Handshaking, queues);
        self.send_handshake(handle, now, cfg, queues);
        Ok(())
    }

    fn send_handshake(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        queues: &mut Queues,
    ) {
        let Some(host) = self.host else {
            debug_assert!(false, "handshake without host ports");
            return;
        };
        let body = HandshakeRequest {
            host_ip: host.ip,
            cmd_port: host.cmd_port,
            data_port: host.data_port,
        }
        .encode();
        debug!(device = %self.serial, cycle = self.handshake_cycles + 1, "sending handshake");
        self.send_on_lane(
            handle,
            now,
            codes::HANDSHAKE,
            body,
            cfg.default_command_timeout,
            cfg.command_retries,
            Origin::Handshake,
            queues,
        );
    }

    /// Queue a tracked command on the lane and put its first transmission on the wire
    fn send_on_lane(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        code: u16,
        body: Bytes,
        timeout: Duration,
        retries: u32,
        origin: Origin,
        queues: &mut Queues,
    ) {
        let Some(lane) = &mut self.command else {
            debug_assert!(false, "command without a lane");
            return;
        };
        // Keep deadline arithmetic safe whatever timeout the caller supplied
        let timeout = timeout.min(MAX_COMMAND_TIMEOUT);
        let seq = lane.push(now, code, body, timeout, retries, origin);
        self.transmit_seq(handle, seq, queues);
        self.arm_command_retry();
    }

    /// Push the encoded form of an outstanding request onto the transmit queue
    fn transmit_seq(&mut self, handle: DeviceHandle, seq: u16, queues: &mut Queues) {
        let encoded = self.command.as_ref().and_then(|lane| lane.encoded(seq));
        if let Some(contents) = encoded {
            queues.transmits.push_back(Transmit {
                handle,
                destination: self.cmd_addr(),
                contents,
            });
        }
    }

    fn arm_command_retry(&mut self) {
        match self.command.as_ref().and_then(CommandLane::next_deadline) {
            Some(deadline) => self.timers.set(Timer::CommandRetry, deadline),
            None => self.timers.stop(Timer::CommandRetry),
        }
    }

    /// Client command entry point
    pub(crate) fn send_command(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        code: u16,
        body: Bytes,
        timeout: Option<Duration>,
        token: CommandToken,
        queues: &mut Queues,
    ) -> Result<(), SendError> {
        if !matches!(self.state, State::Connected | State::Sampling) {
            return Err(SendError::NotConnected(self.state));
        }
        if body.len() > wire::MAX_COMMAND_BODY {
            return Err(SendError::TooLarge);
        }
        let outstanding = self.command.as_ref().map_or(0, CommandLane::outstanding);
        if outstanding >= MAX_PENDING_COMMANDS {
            return Err(SendError::Backlogged);
        }
        self.send_on_lane(
            handle,
            now,
            code,
            body,
            timeout.unwrap_or(cfg.default_command_timeout),
            cfg.command_retries,
            Origin::Client(token),
            queues,
        );
        Ok(())
    }

    /// Ask the device to start streaming; completion drives the `Sampling` transition
    pub(crate) fn start_sampling(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        queues: &mut Queues,
    ) -> Result<(), SamplingError> {
        if self.state != State::Connected {
            return Err(SamplingError::InvalidState(self.state));
        }
        if self
            .command
            .as_ref()
            .is_some_and(|lane| lane.has_origin(Origin::StartSampling))
        {
            return Err(SamplingError::RequestPending);
        }
        self.send_on_lane(
            handle,
            now,
            codes::START_SAMPLING,
            Bytes::new(),
            cfg.default_command_timeout,
            cfg.command_retries,
            Origin::StartSampling,
            queues,
        );
        Ok(())
    }

    /// Stop streaming and end the session
    ///
    /// The stop command is best-effort: one transmission, no retry, no
    /// completion tracking. Local teardown does not wait for the device.
    pub(crate) fn stop_sampling(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        queues: &mut Queues,
    ) -> Result<(), SamplingError> {
        if self.state != State::Sampling {
            return Err(SamplingError::InvalidState(self.state));
        }
        self.transmit_untracked(handle, codes::STOP_SAMPLING, queues);
        self.teardown(handle, now, cfg, None, queues);
        Ok(())
    }

    /// End the session from any active state
    pub(crate) fn disconnect(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        queues: &mut Queues,
    ) -> Result<(), ConnectError> {
        if !matches!(
            self.state,
            State::Handshaking | State::Connected | State::Sampling
        ) {
            return Err(ConnectError::InvalidState(self.state));
        }
        self.transmit_untracked(handle, codes::DISCONNECT, queues);
        self.teardown(handle, now, cfg, None, queues);
        Ok(())
    }

    /// Single best-effort transmission outside the pending table
    fn transmit_untracked(&mut self, handle: DeviceHandle, code: u16, queues: &mut Queues) {
        let Some(lane) = &mut self.command else {
            return;
        };
        let seq = lane.alloc_untracked();
        queues.transmits.push_back(Transmit {
            handle,
            destination: self.cmd_addr(),
            contents: wire::CommandRequest {
                code,
                body: Bytes::new(),
            }
            .encode(seq),
        });
    }

    /// Discovery declared the device gone
    pub(crate) fn on_discovery_lost(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        queues: &mut Queues,
    ) {
        if self.state == State::Disconnected {
            return;
        }
        self.teardown(handle, now, cfg, Some(LostReason::AnnouncementsStopped), queues);
    }

    /// Cancel everything for endpoint shutdown
    ///
    /// Active sessions get a parting best-effort disconnect; devices without a
    /// session are left alone.
    pub(crate) fn shutdown(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        queues: &mut Queues,
    ) {
        let _ = self.disconnect(handle, now, cfg, queues);
    }

    /// Close lanes, cancel outstanding work, and become `Disconnected`
    ///
    /// `lost` distinguishes involuntary loss from requested teardown; it decides
    /// the cancellation error and whether `DeviceLost` is emitted.
    fn teardown(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        lost: Option<LostReason>,
        queues: &mut Queues,
    ) {
        // The stream closes before the state transition completes
        if let Some(lane) = self.data.take() {
            debug!(
                device = %self.serial,
                frames = lane.frames,
                points = lane.points,
                open_for = ?now.duration_since(lane.opened),
                "point stream closed"
            );
        }
        let cancel_err = match lost {
            Some(_) => CommandError::DeviceLost,
            None => CommandError::Cancelled,
        };
        if let Some(mut lane) = self.command.take() {
            if lane.stale_acks != 0 || lane.decode_errors != 0 {
                debug!(
                    device = %self.serial,
                    stale_acks = lane.stale_acks,
                    undecodable = lane.decode_errors,
                    "command lane noise"
                );
            }
            for pending in lane.cancel_all() {
                match pending.origin {
                    Origin::Client(token) => queues.events.push_back(Event::CommandComplete {
                        handle,
                        token,
                        result: Err(cancel_err),
                    }),
                    Origin::StartSampling => queues.events.push_back(Event::SamplingRejected {
                        handle,
                        error: cancel_err,
                    }),
                    // Internal upkeep dies with the session
                    Origin::Handshake | Origin::DeviceInfo | Origin::Keepalive => {}
                }
            }
        }
        self.host = None;
        self.keepalive_misses = 0;
        self.handshake_cycles = 0;
        self.timers.stop_all();
        self.timers.set(Timer::Prune, now + cfg.prune_grace);
        if let Some(reason) = lost {
            queues.events.push_back(Event::DeviceLost { handle, reason });
        }
        self.set_state(handle, State::Disconnected, queues);
    }

    /// Datagram arriving on this device's command socket
    pub(crate) fn handle_command_datagram(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        remote: SocketAddr,
        datagram: &[u8],
        queues: &mut Queues,
    ) {
        let expected = self.cmd_addr();
        let Some(lane) = &mut self.command else {
            trace!(device = %self.serial, "command datagram without a lane");
            return;
        };
        if remote != expected {
            lane.stale_acks += 1;
            trace!(device = %self.serial, %remote, "command datagram from foreign source");
            return;
        }
        let (seq, ack) = match wire::decode(datagram) {
            Ok(wire::Message::Ack { seq, ack }) => (seq, ack),
            Ok(_) => {
                lane.decode_errors += 1;
                debug!(device = %self.serial, "unexpected datagram family on command socket");
                return;
            }
            Err(e) => {
                lane.decode_errors += 1;
                debug!(device = %self.serial, error = %e, "undecodable command datagram");
                return;
            }
        };
        match lane.match_ack(seq, ack.code) {
            AckDisposition::Stale => {}
            AckDisposition::Completed(pending) => {
                trace!(
                    device = %self.serial,
                    seq,
                    code = ack.code,
                    status = ack.status,
                    "ack matched"
                );
                self.on_completed(handle, now, cfg, pending.origin, Ok(ack), queues);
            }
        }
        self.arm_command_retry();
    }

    /// Route a terminal command outcome to whoever asked for it
    fn on_completed(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        origin: Origin,
        outcome: Result<CommandAck, CommandError>,
        queues: &mut Queues,
    ) {
        match origin {
            Origin::Client(token) => {
                queues.events.push_back(Event::CommandComplete {
                    handle,
                    token,
                    result: outcome,
                });
            }
            Origin::Handshake => match outcome {
                Ok(ack) if ack.ok() => self.on_handshake_ok(handle, now, cfg, &ack, queues),
                Ok(ack) => {
                    let error = CommandError::Rejected(ack.status);
                    self.on_handshake_failed(handle, now, cfg, error, queues)
                }
                Err(e) => self.on_handshake_failed(handle, now, cfg, e, queues),
            },
            Origin::DeviceInfo => match outcome {
                Ok(ack) if ack.ok() => match wire::DeviceInfoAck::decode(&ack.body) {
                    Ok(info) => {
                        debug!(device = %self.serial, firmware = %info.firmware, "device info");
                        if let Some(session) = &mut self.session {
                            session.firmware = Some(info.firmware);
                        }
                    }
                    Err(e) => debug!(device = %self.serial, error = %e, "bad device info payload"),
                },
                // Informational; the session stands either way
                Ok(ack) => debug!(device = %self.serial, status = ack.status, "device info rejected"),
                Err(e) => debug!(device = %self.serial, error = %e, "device info query failed"),
            },
            Origin::Keepalive => match outcome {
                Ok(ack) if ack.ok() => {
                    self.keepalive_misses = 0;
                }
                _ => self.on_keepalive_miss(handle, now, cfg, queues),
            },
            Origin::StartSampling => match outcome {
                Ok(ack) if ack.ok() => self.enter_sampling(handle, now, cfg, queues),
                Ok(ack) => {
                    debug!(device = %self.serial, status = ack.status, "sampling rejected by device");
                    queues.events.push_back(Event::SamplingRejected {
                        handle,
                        error: CommandError::Rejected(ack.status),
                    });
                }
                Err(e) => {
                    queues.events.push_back(Event::SamplingRejected { handle, error: e });
                }
            },
        }
    }

    fn on_handshake_ok(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        ack: &CommandAck,
        queues: &mut Queues,
    ) {
        if self.state != State::Handshaking {
            return;
        }
        let session = match HandshakeAck::decode(&ack.body) {
            Ok(hs) => hs,
            Err(e) => {
                warn!(device = %self.serial, error = %e, "malformed handshake ack");
                self.on_handshake_failed(handle, now, cfg, CommandError::Rejected(0), queues);
                return;
            }
        };
        self.session = Some(SessionParams {
            protocol: session.protocol,
            point_format: session.point_format,
            firmware: None,
        });
        debug!(
            device = %self.serial,
            protocol = session.protocol,
            format = ?session.point_format,
            "session established"
        );
        self.set_state(handle, State::Connected, queues);
        if let Some(interval) = cfg.keepalive_interval {
            self.timers.set(Timer::Keepalive, now + interval);
        }
        self.send_on_lane(
            handle,
            now,
            codes::QUERY_DEVICE_INFO,
            Bytes::new(),
            cfg.default_command_timeout,
            cfg.command_retries,
            Origin::DeviceInfo,
            queues,
        );
    }

    fn on_handshake_failed(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        error: CommandError,
        queues: &mut Queues,
    ) {
        if self.state != State::Handshaking {
            return;
        }
        self.handshake_cycles += 1;
        debug!(
            device = %self.serial,
            cycle = self.handshake_cycles,
            error = %error,
            "handshake cycle failed"
        );
        if self.handshake_cycles >= cfg.handshake_attempts {
            self.teardown(handle, now, cfg, Some(LostReason::HandshakeFailed), queues);
        } else {
            self.send_handshake(handle, now, cfg, queues);
        }
    }

    fn on_keepalive_miss(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        queues: &mut Queues,
    ) {
        self.keepalive_misses += 1;
        debug!(
            device = %self.serial,
            misses = self.keepalive_misses,
            "keepalive went unanswered"
        );
        if self.keepalive_misses >= cfg.keepalive_miss_limit {
            self.teardown(handle, now, cfg, Some(LostReason::KeepaliveTimeout), queues);
        }
    }

    fn enter_sampling(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        queues: &mut Queues,
    ) {
        if self.state != State::Connected {
            return;
        }
        self.data = Some(DataLane::new(now));
        self.timers
            .set(Timer::DataLiveness, now + cfg.data_liveness_window);
        self.set_state(handle, State::Sampling, queues);
    }

    /// Datagram arriving on this device's data socket
    pub(crate) fn handle_data_datagram(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        remote: SocketAddr,
        datagram: &[u8],
        queues: &mut Queues,
    ) {
        if remote.ip() != self.addr {
            self.stats.stale_source += 1;
            return;
        }
        let frame = match wire::decode(datagram) {
            Ok(wire::Message::Data(frame)) => frame,
            Ok(_) => {
                self.stats.unexpected_family += 1;
                return;
            }
            Err(e) => {
                match e {
                    wire::WireError::UnexpectedEnd => self.stats.truncated += 1,
                    wire::WireError::BadLength => self.stats.bad_length += 1,
                    wire::WireError::UnknownFormat(_) => self.stats.unknown_format += 1,
                    _ => self.stats.bad_header += 1,
                }
                trace!(device = %self.serial, error = %e, "stream frame dropped");
                return;
            }
        };
        if self.state != State::Sampling {
            self.stats.not_sampling += 1;
            return;
        }
        let points = frame.points.len() as u64;
        self.stats.frames += 1;
        self.stats.points += points;
        if let Some(lane) = &mut self.data {
            lane.frames += 1;
            lane.points += points;
        }
        // Only a valid frame proves the stream is alive
        self.timers
            .set(Timer::DataLiveness, now + cfg.data_liveness_window);
        queues.events.push_back(Event::Frame { handle, frame });
    }

    /// Process expired timers; returns true when the registry entry should be dropped
    pub(crate) fn handle_timeout(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        queues: &mut Queues,
    ) -> bool {
        let mut remove = false;
        for &timer in &Timer::VALUES {
            if !self.timers.is_expired(timer, now) {
                continue;
            }
            self.timers.stop(timer);
            trace!(device = %self.serial, ?timer, "timeout");
            match timer {
                Timer::CommandRetry => self.on_command_deadlines(handle, now, cfg, queues),
                Timer::Keepalive => self.on_keepalive_timer(handle, now, cfg, queues),
                Timer::DataLiveness => {
                    if self.state == State::Sampling {
                        debug!(device = %self.serial, "point stream stalled");
                        self.teardown(handle, now, cfg, Some(LostReason::DataStalled), queues);
                    }
                }
                Timer::Prune => {
                    if self.state == State::Disconnected {
                        remove = true;
                    }
                }
            }
        }
        remove
    }

    fn on_command_deadlines(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        queues: &mut Queues,
    ) {
        let sweep = match &mut self.command {
            Some(lane) => lane.handle_deadlines(now, cfg.backoff_factor),
            None => return,
        };
        for seq in sweep.retransmit {
            trace!(device = %self.serial, seq, "retransmitting command");
            self.transmit_seq(handle, seq, queues);
        }
        for (seq, pending) in sweep.exhausted {
            debug!(
                device = %self.serial,
                seq,
                code = pending.code,
                attempts = pending.attempt + 1,
                waited = ?now.duration_since(pending.issued),
                "command retry budget exhausted"
            );
            self.on_completed(
                handle,
                now,
                cfg,
                pending.origin,
                Err(CommandError::TimedOut),
                queues,
            );
        }
        self.arm_command_retry();
    }

    fn on_keepalive_timer(
        &mut self,
        handle: DeviceHandle,
        now: Instant,
        cfg: &Config,
        queues: &mut Queues,
    ) {
        if !matches!(self.state, State::Connected | State::Sampling) {
            return;
        }
        let Some(interval) = cfg.keepalive_interval else {
            return;
        };
        let probe_outstanding = self
            .command
            .as_ref()
            .is_some_and(|lane| lane.has_origin(Origin::Keepalive));
        if !probe_outstanding {
            // The probe's own deadline, not retries, detects the miss
            self.send_on_lane(
                handle,
                now,
                codes::KEEPALIVE,
                Bytes::new(),
                interval,
                0,
                Origin::Keepalive,
                queues,
            );
        }
        self.timers.set(Timer::Keepalive, now + interval);
    }
}
