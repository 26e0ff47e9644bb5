use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::wire::{
    codes, Announcement, Capabilities, CartesianPoint, CommandAck, CommandRequest, DataFrame,
    DeviceId, DeviceInfoAck, DeviceKind, FirmwareVersion, HandshakeAck, HandshakeRequest,
    PointFormat, Points,
};
use crate::{wire, Config, DataStats, DeviceHandle, Endpoint, Event, HostPorts, State};

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8"),
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

/// Host sockets every test pretends to have bound
pub(super) const HOST: HostPorts = HostPorts {
    ip: Ipv4Addr::new(192, 168, 1, 2),
    cmd_port: 51000,
    data_port: 51001,
};

/// An endpoint talking to one scripted device
pub(super) struct Pair {
    pub(super) endpoint: Endpoint,
    pub(super) time: Instant,
    pub(super) device: SimDevice,
}

impl Pair {
    pub(super) fn new(config: Config) -> Self {
        Self {
            endpoint: Endpoint::new(Arc::new(config)),
            time: Instant::now(),
            device: SimDevice::new(40),
        }
    }

    /// Feed one announcement from the scripted device
    pub(super) fn announce(&mut self) -> Option<DeviceHandle> {
        let datagram = self.device.announcement();
        self.endpoint
            .handle_discovery_datagram(self.time, self.device.announce_source(), &datagram)
    }

    pub(super) fn connect(&mut self, handle: DeviceHandle) {
        self.endpoint.connect(self.time, handle, HOST).unwrap();
    }

    /// Move queued transmits into the device's inbox
    ///
    /// Returns how many datagrams were delivered.
    pub(super) fn drive(&mut self, handle: DeviceHandle) -> usize {
        let mut delivered = 0;
        while let Some(transmit) = self.endpoint.poll_transmit() {
            assert_eq!(transmit.handle, handle);
            assert_eq!(transmit.destination, self.device.cmd_addr());
            match wire::decode(&transmit.contents).unwrap() {
                wire::Message::Request { seq, request } => {
                    self.device.inbox.push((seq, request));
                }
                other => panic!("endpoint transmitted {other:?}"),
            }
            delivered += 1;
        }
        delivered
    }

    /// Deliver a datagram on the device's command lane
    pub(super) fn recv_command(&mut self, handle: DeviceHandle, datagram: &[u8]) {
        self.endpoint
            .handle_command_datagram(self.time, handle, self.device.cmd_addr(), datagram);
    }

    /// Deliver a datagram on the device's data lane
    pub(super) fn recv_data(&mut self, handle: DeviceHandle, datagram: &[u8]) {
        self.endpoint
            .handle_data_datagram(self.time, handle, self.device.data_source(), datagram);
    }

    /// Advance time by `d` and run expirations
    pub(super) fn step(&mut self, d: Duration) {
        self.time += d;
        self.endpoint.handle_timeout(self.time);
    }

    /// Jump to the next deadline and run it; returns how far time moved
    pub(super) fn step_to_deadline(&mut self) -> Duration {
        let deadline = self.endpoint.poll_timeout().expect("nothing scheduled");
        let jumped = deadline.saturating_duration_since(self.time);
        self.time = self.time.max(deadline);
        self.endpoint.handle_timeout(self.time);
        jumped
    }

    /// Drain every queued event
    pub(super) fn events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.endpoint.poll_event() {
            events.push(event);
        }
        events
    }

    pub(super) fn state(&self, handle: DeviceHandle) -> State {
        self.endpoint.device(handle).unwrap().state
    }

    pub(super) fn stats(&self, handle: DeviceHandle) -> DataStats {
        self.endpoint.device(handle).unwrap().data_stats
    }

    /// Announce, connect, and complete the handshake and info exchange
    pub(super) fn establish(&mut self) -> DeviceHandle {
        let handle = self.announce().unwrap();
        self.connect(handle);
        assert_eq!(self.drive(handle), 1);
        let (seq, request) = self.device.inbox.pop().unwrap();
        assert_eq!(request.code, codes::HANDSHAKE);
        let hello = HandshakeRequest::decode(&request.body).unwrap();
        assert_eq!((hello.cmd_port, hello.data_port), (HOST.cmd_port, HOST.data_port));
        let ack = self.device.handshake_ack(seq);
        self.recv_command(handle, &ack);
        assert_eq!(self.state(handle), State::Connected);

        // The endpoint follows up with a firmware query
        assert_eq!(self.drive(handle), 1);
        let (seq, request) = self.device.inbox.pop().unwrap();
        assert_eq!(request.code, codes::QUERY_DEVICE_INFO);
        let ack = self.device.info_ack(seq);
        self.recv_command(handle, &ack);
        self.events();
        handle
    }

    /// Ask for sampling and let the device accept
    pub(super) fn begin_sampling(&mut self, handle: DeviceHandle) {
        self.endpoint.start_sampling(self.time, handle).unwrap();
        assert_eq!(self.drive(handle), 1);
        let (seq, request) = self.device.inbox.pop().unwrap();
        assert_eq!(request.code, codes::START_SAMPLING);
        let ack = self.device.ack(seq, codes::START_SAMPLING, 0, Bytes::new());
        self.recv_command(handle, &ack);
        assert_eq!(self.state(handle), State::Sampling);
        self.events();
    }
}

impl Default for Pair {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// Wire-level stand-in for a real device
pub(super) struct SimDevice {
    pub(super) serial: DeviceId,
    pub(super) model: DeviceKind,
    pub(super) protocol: u8,
    pub(super) capabilities: Capabilities,
    pub(super) point_format: PointFormat,
    pub(super) firmware: FirmwareVersion,
    pub(super) ip: Ipv4Addr,
    pub(super) cmd_port: u16,
    announce_seq: u16,
    frame_seq: u16,
    /// Requests the endpoint has sent us, oldest first
    pub(super) inbox: Vec<(u16, CommandRequest)>,
}

impl SimDevice {
    /// A Scout-16 at 192.168.1.`host_octet`
    pub(super) fn new(host_octet: u8) -> Self {
        let mut serial = *b"VL16-000017-0000";
        serial[14] = b'0' + (host_octet / 10) % 10;
        serial[15] = b'0' + host_octet % 10;
        Self {
            serial: DeviceId(serial),
            model: DeviceKind::Scout16,
            protocol: 1,
            capabilities: Capabilities::IMU | Capabilities::TIME_SYNC,
            point_format: PointFormat::Cartesian,
            firmware: FirmwareVersion([2, 1, 0, 9]),
            ip: Ipv4Addr::new(192, 168, 1, host_octet),
            cmd_port: 56100,
            announce_seq: 0,
            frame_seq: 0,
            inbox: Vec::new(),
        }
    }

    pub(super) fn cmd_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.cmd_port)
    }

    /// Announcements come from the device's ephemeral broadcast source
    pub(super) fn announce_source(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), 49152)
    }

    /// Stream frames come from the device's data source port
    pub(super) fn data_source(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.cmd_port + 1)
    }

    pub(super) fn announcement(&mut self) -> Box<[u8]> {
        let seq = self.announce_seq;
        self.announce_seq = self.announce_seq.wrapping_add(1);
        Announcement {
            serial: self.serial,
            model: self.model,
            protocol: self.protocol,
            capabilities: self.capabilities,
            cmd_port: self.cmd_port,
        }
        .encode(seq)
    }

    pub(super) fn ack(&self, seq: u16, code: u16, status: u8, body: Bytes) -> Box<[u8]> {
        CommandAck { code, status, body }.encode(seq)
    }

    pub(super) fn handshake_ack(&self, seq: u16) -> Box<[u8]> {
        let body = HandshakeAck {
            protocol: self.protocol,
            point_format: self.point_format,
        }
        .encode();
        self.ack(seq, codes::HANDSHAKE, 0, body)
    }

    pub(super) fn info_ack(&self, seq: u16) -> Box<[u8]> {
        let body = DeviceInfoAck {
            firmware: self.firmware,
        }
        .encode();
        self.ack(seq, codes::QUERY_DEVICE_INFO, 0, body)
    }

    /// A frame of identical cartesian points
    pub(super) fn frame(&mut self, timestamp_us: u64, count: usize) -> Box<[u8]> {
        let seq = self.frame_seq;
        self.frame_seq = self.frame_seq.wrapping_add(1);
        let point = CartesianPoint {
            x: 1200,
            y: -340,
            z: 25,
            reflectivity: 47,
        };
        DataFrame {
            timestamp_us,
            seq,
            points: Points::Cartesian(vec![point; count]),
        }
        .encode()
    }
}
