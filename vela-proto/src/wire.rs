//! Datagram codec for the device protocol
//!
//! Byte layouts here are a fixed contract with shipping firmware and must be
//! preserved bit-exact. Every datagram starts with a 9 byte preamble protected by a
//! CRC-16; command requests and acknowledgements additionally carry a CRC-32 over
//! their payload. Announcements and point stream frames omit the payload checksum,
//! the header guard is enough on channels where individual losses are tolerable.
//!
//! All integers are little-endian.

use std::net::Ipv4Addr;
use std::{fmt, ops};

use bytes::{Buf, BufMut, Bytes};
use crc::{Crc, CRC_16_IBM_SDLC, CRC_32_ISO_HDLC};
use thiserror::Error;

/// UDP port devices broadcast announcements to
pub const ANNOUNCE_PORT: u16 = 56000;
/// First byte of every datagram
pub const SOF: u8 = 0xAA;
/// Protocol revision implemented by this crate
pub const PROTOCOL_VERSION: u8 = 0x01;
/// Bytes in the datagram preamble, its checksum included
pub const HEADER_LEN: usize = 9;
/// Most points a single stream frame can carry
pub const MAX_POINTS_PER_FRAME: usize = 255;
/// Longest body a command request can carry
///
/// The 16 bit length field covers the whole datagram: preamble, command code,
/// body, and the trailing payload checksum.
pub const MAX_COMMAND_BODY: usize = u16::MAX as usize - HEADER_LEN - 2 - 4;

const HEADER_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);
const PAYLOAD_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Well-known command codes
///
/// Codes outside this set pass through the command lane opaquely, so applications
/// can issue vendor extension commands without codec support.
pub mod codes {
    /// Session setup, carrying the host address and port pair
    pub const HANDSHAKE: u16 = 0x0001;
    /// Firmware revision query
    pub const QUERY_DEVICE_INFO: u16 = 0x0002;
    /// Command lane liveness probe
    pub const KEEPALIVE: u16 = 0x0003;
    /// Begin point stream delivery
    pub const START_SAMPLING: u16 = 0x0004;
    /// End point stream delivery
    pub const STOP_SAMPLING: u16 = 0x0005;
    /// Orderly session teardown
    pub const DISCONNECT: u16 = 0x0006;
}

/// Reasons a datagram or payload failed to decode
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Datagram or payload ended before the advertised content
    #[error("unexpected end of datagram")]
    UnexpectedEnd,
    /// First byte was not the start-of-frame marker
    #[error("bad start-of-frame byte")]
    BadSof,
    /// Protocol revision this crate does not speak
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    /// Length field disagrees with the actual datagram size
    #[error("length field disagrees with datagram size")]
    BadLength,
    /// Preamble checksum mismatch
    #[error("header checksum mismatch")]
    HeaderCrc,
    /// Payload checksum mismatch
    #[error("payload checksum mismatch")]
    PayloadCrc,
    /// Frame kind outside the known set
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    /// Device model outside the known set
    #[error("unknown device model {0}")]
    UnknownModel(u8),
    /// Point encoding outside the known set
    #[error("unknown point format {0}")]
    UnknownFormat(u8),
}

/// The four datagram families
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Kind {
    /// Periodic device broadcast
    Announce = 0,
    /// Host to device command
    CommandRequest = 1,
    /// Device to host command result
    CommandAck = 2,
    /// Point stream frame
    Data = 3,
}

impl Kind {
    fn from_u8(x: u8) -> Option<Self> {
        match x {
            0 => Some(Self::Announce),
            1 => Some(Self::CommandRequest),
            2 => Some(Self::CommandAck),
            3 => Some(Self::Data),
            _ => None,
        }
    }
}

/// Unique hardware identifier burned into each device
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceId(pub [u8; 16]);

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<[u8; 16]> for DeviceId {
    fn from(x: [u8; 16]) -> Self {
        Self(x)
    }
}

/// Device model families
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DeviceKind {
    /// 16 channel mid-range unit
    Scout16 = 0,
    /// 32 channel mid-range unit
    Scout32 = 1,
    /// Long-range narrow field unit
    Ranger = 2,
}

impl DeviceKind {
    fn from_u8(x: u8) -> Option<Self> {
        match x {
            0 => Some(Self::Scout16),
            1 => Some(Self::Scout32),
            2 => Some(Self::Ranger),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Scout16 => "Scout-16",
            Self::Scout32 => "Scout-32",
            Self::Ranger => "Ranger",
        })
    }
}

/// Capability bits a device advertises in its announcements
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct Capabilities(pub u8);

impl Capabilities {
    /// Onboard IMU sample stream available
    pub const IMU: Self = Self(1 << 0);
    /// Dual-return measurements supported
    pub const DUAL_RETURN: Self = Self(1 << 1);
    /// Hardware timestamp synchronization supported
    pub const TIME_SYNC: Self = Self(1 << 2);

    /// Whether all bits of `other` are set in `self`
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl ops::BitOr for Capabilities {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (bit, name) in [
            (Self::IMU, "IMU"),
            (Self::DUAL_RETURN, "DUAL_RETURN"),
            (Self::TIME_SYNC, "TIME_SYNC"),
        ] {
            if self.contains(bit) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

/// Firmware revision reported by a device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FirmwareVersion(pub [u8; 4]);

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

/// Encoding of the points in a stream frame
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PointFormat {
    /// Rectangular millimetre coordinates
    Cartesian = 0,
    /// Range and direction angles
    Spherical = 1,
}

impl PointFormat {
    fn from_u8(x: u8) -> Option<Self> {
        match x {
            0 => Some(Self::Cartesian),
            1 => Some(Self::Spherical),
            _ => None,
        }
    }
}

/// A decoded inbound datagram
#[derive(Debug)]
pub enum Message {
    /// Periodic device broadcast
    Announce(Announcement),
    /// Host to device command, as seen by device emulators
    Request {
        /// Command lane sequence number
        seq: u16,
        /// Decoded request
        request: CommandRequest,
    },
    /// Device response correlated by sequence number
    Ack {
        /// Sequence number of the request being answered
        seq: u16,
        /// Decoded acknowledgement
        ack: CommandAck,
    },
    /// Point stream frame
    Data(DataFrame),
}

/// Decode any datagram family, validating preamble and checksums
pub fn decode(datagram: &[u8]) -> Result<Message, WireError> {
    let mut buf = datagram;
    if buf.remaining() < HEADER_LEN {
        return Err(WireError::UnexpectedEnd);
    }
    if buf.get_u8() != SOF {
        return Err(WireError::BadSof);
    }
    let version = buf.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(WireError::BadVersion(version));
    }
    if buf.get_u16_le() as usize != datagram.len() {
        return Err(WireError::BadLength);
    }
    let kind = buf.get_u8();
    let seq = buf.get_u16_le();
    let crc = buf.get_u16_le();
    if HEADER_CRC.checksum(&datagram[..HEADER_LEN - 2]) != crc {
        return Err(WireError::HeaderCrc);
    }
    let kind = Kind::from_u8(kind).ok_or(WireError::UnknownKind(kind))?;
    let body = &datagram[HEADER_LEN..];
    match kind {
        Kind::Announce => Ok(Message::Announce(Announcement::decode(body)?)),
        Kind::CommandRequest => {
            let payload = checked_payload(body)?;
            Ok(Message::Request {
                seq,
                request: CommandRequest::decode(payload)?,
            })
        }
        Kind::CommandAck => {
            let payload = checked_payload(body)?;
            Ok(Message::Ack {
                seq,
                ack: CommandAck::decode(payload)?,
            })
        }
        Kind::Data => Ok(Message::Data(DataFrame::decode(seq, body)?)),
    }
}

/// Split off and verify the trailing payload CRC-32
fn checked_payload(body: &[u8]) -> Result<&[u8], WireError> {
    if body.len() < 4 {
        return Err(WireError::UnexpectedEnd);
    }
    let (payload, tail) = body.split_at(body.len() - 4);
    let got = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    if PAYLOAD_CRC.checksum(payload) != got {
        return Err(WireError::PayloadCrc);
    }
    Ok(payload)
}

fn encode_datagram(kind: Kind, seq: u16, payload: &[u8], payload_crc: bool) -> Box<[u8]> {
    let crc_len = if payload_crc { 4 } else { 0 };
    let total = HEADER_LEN + payload.len() + crc_len;
    debug_assert!(total <= u16::MAX as usize);
    let mut buf = Vec::with_capacity(total);
    buf.put_u8(SOF);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16_le(total as u16);
    buf.put_u8(kind as u8);
    buf.put_u16_le(seq);
    let crc = HEADER_CRC.checksum(&buf[..HEADER_LEN - 2]);
    buf.put_u16_le(crc);
    buf.put_slice(payload);
    if payload_crc {
        buf.put_u32_le(PAYLOAD_CRC.checksum(payload));
    }
    buf.into_boxed_slice()
}

fn need(buf: &impl Buf, n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        return Err(WireError::UnexpectedEnd);
    }
    Ok(())
}

/// Periodic broadcast identifying a device and where to command it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Hardware identity
    pub serial: DeviceId,
    /// Model family
    pub model: DeviceKind,
    /// Protocol revision the device speaks
    pub protocol: u8,
    /// Advertised capability bits
    pub capabilities: Capabilities,
    /// UDP port the device accepts commands on
    pub cmd_port: u16,
}

impl Announcement {
    fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        need(&body, 21)?;
        let mut serial = [0; 16];
        body.copy_to_slice(&mut serial);
        let model = body.get_u8();
        let model = DeviceKind::from_u8(model).ok_or(WireError::UnknownModel(model))?;
        Ok(Self {
            serial: DeviceId(serial),
            model,
            protocol: body.get_u8(),
            capabilities: Capabilities(body.get_u8()),
            cmd_port: body.get_u16_le(),
        })
    }

    /// Encode a complete announcement datagram
    pub fn encode(&self, seq: u16) -> Box<[u8]> {
        let mut payload = Vec::with_capacity(21);
        payload.put_slice(&self.serial.0);
        payload.put_u8(self.model as u8);
        payload.put_u8(self.protocol);
        payload.put_u8(self.capabilities.0);
        payload.put_u16_le(self.cmd_port);
        encode_datagram(Kind::Announce, seq, &payload, false)
    }
}

/// Host to device command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Command code, see [`codes`]
    pub code: u16,
    /// Command-specific payload
    pub body: Bytes,
}

impl CommandRequest {
    fn decode(mut payload: &[u8]) -> Result<Self, WireError> {
        need(&payload, 2)?;
        let code = payload.get_u16_le();
        Ok(Self {
            code,
            body: Bytes::copy_from_slice(payload),
        })
    }

    /// Encode a complete command request datagram
    pub fn encode(&self, seq: u16) -> Box<[u8]> {
        let mut payload = Vec::with_capacity(2 + self.body.len());
        payload.put_u16_le(self.code);
        payload.put_slice(&self.body);
        encode_datagram(Kind::CommandRequest, seq, &payload, true)
    }
}

/// Device response to a command request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAck {
    /// Code of the command being answered
    pub code: u16,
    /// Device status, zero on success
    pub status: u8,
    /// Command-specific result payload
    pub body: Bytes,
}

impl CommandAck {
    fn decode(mut payload: &[u8]) -> Result<Self, WireError> {
        need(&payload, 3)?;
        let code = payload.get_u16_le();
        let status = payload.get_u8();
        Ok(Self {
            code,
            status,
            body: Bytes::copy_from_slice(payload),
        })
    }

    /// Encode a complete acknowledgement datagram
    pub fn encode(&self, seq: u16) -> Box<[u8]> {
        let mut payload = Vec::with_capacity(3 + self.body.len());
        payload.put_u16_le(self.code);
        payload.put_u8(self.status);
        payload.put_slice(&self.body);
        encode_datagram(Kind::CommandAck, seq, &payload, true)
    }

    /// Whether the device reported success
    pub fn ok(&self) -> bool {
        self.status == 0
    }
}

/// One point in rectangular coordinates, millimetres
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CartesianPoint {
    /// Forward axis
    pub x: i32,
    /// Left axis
    pub y: i32,
    /// Up axis
    pub z: i32,
    /// Return strength
    pub reflectivity: u8,
}

/// One point as range plus direction
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SphericalPoint {
    /// Range in millimetres
    pub depth: u32,
    /// Azimuth in centidegrees
    pub theta: u16,
    /// Zenith in centidegrees
    pub phi: u16,
    /// Return strength
    pub reflectivity: u8,
}

/// Point batch in one of the supported encodings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Points {
    /// Rectangular millimetre coordinates
    Cartesian(Vec<CartesianPoint>),
    /// Range and direction angles
    Spherical(Vec<SphericalPoint>),
}

impl Points {
    /// Number of points in the batch
    pub fn len(&self) -> usize {
        match self {
            Self::Cartesian(v) => v.len(),
            Self::Spherical(v) => v.len(),
        }
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn format(&self) -> PointFormat {
        match self {
            Self::Cartesian(_) => PointFormat::Cartesian,
            Self::Spherical(_) => PointFormat::Spherical,
        }
    }
}

/// A decoded unit of streaming sensor output
///
/// Produced and consumed within a single dispatch, never retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Device clock at capture, microseconds
    pub timestamp_us: u64,
    /// Rolling frame sequence from the datagram preamble
    pub seq: u16,
    /// The point batch
    pub points: Points,
}

const CARTESIAN_POINT_LEN: usize = 13;
const SPHERICAL_POINT_LEN: usize = 9;

impl DataFrame {
    fn decode(seq: u16, mut body: &[u8]) -> Result<Self, WireError> {
        need(&body, 10)?;
        let timestamp_us = body.get_u64_le();
        let format = body.get_u8();
        let format = PointFormat::from_u8(format).ok_or(WireError::UnknownFormat(format))?;
        let count = body.get_u8() as usize;
        let point_len = match format {
            PointFormat::Cartesian => CARTESIAN_POINT_LEN,
            PointFormat::Spherical => SPHERICAL_POINT_LEN,
        };
        if body.remaining() < count * point_len {
            return Err(WireError::UnexpectedEnd);
        }
        if body.remaining() > count * point_len {
            return Err(WireError::BadLength);
        }
        let points = match format {
            PointFormat::Cartesian => {
                let mut points = Vec::with_capacity(count);
                for _ in 0..count {
                    points.push(CartesianPoint {
                        x: body.get_i32_le(),
                        y: body.get_i32_le(),
                        z: body.get_i32_le(),
                        reflectivity: body.get_u8(),
                    });
                }
                Points::Cartesian(points)
            }
            PointFormat::Spherical => {
                let mut points = Vec::with_capacity(count);
                for _ in 0..count {
                    points.push(SphericalPoint {
                        depth: body.get_u32_le(),
                        theta: body.get_u16_le(),
                        phi: body.get_u16_le(),
                        reflectivity: body.get_u8(),
                    });
                }
                Points::Spherical(points)
            }
        };
        Ok(Self {
            timestamp_us,
            seq,
            points,
        })
    }

    /// Encode a complete point stream datagram
    ///
    /// Panics in debug builds if the batch exceeds [`MAX_POINTS_PER_FRAME`].
    pub fn encode(&self) -> Box<[u8]> {
        debug_assert!(self.points.len() <= MAX_POINTS_PER_FRAME);
        let point_len = match self.points.format() {
            PointFormat::Cartesian => CARTESIAN_POINT_LEN,
            PointFormat::Spherical => SPHERICAL_POINT_LEN,
        };
        let mut payload = Vec::with_capacity(10 + self.points.len() * point_len);
        payload.put_u64_le(self.timestamp_us);
        payload.put_u8(self.points.format() as u8);
        payload.put_u8(self.points.len() as u8);
        match &self.points {
            Points::Cartesian(points) => {
                for p in points {
                    payload.put_i32_le(p.x);
                    payload.put_i32_le(p.y);
                    payload.put_i32_le(p.z);
                    payload.put_u8(p.reflectivity);
                }
            }
            Points::Spherical(points) => {
                for p in points {
                    payload.put_u32_le(p.depth);
                    payload.put_u16_le(p.theta);
                    payload.put_u16_le(p.phi);
                    payload.put_u8(p.reflectivity);
                }
            }
        }
        encode_datagram(Kind::Data, self.seq, &payload, false)
    }
}

/// Payload of the session handshake request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Address the device should send acknowledgements and frames to
    pub host_ip: Ipv4Addr,
    /// Host port for command acknowledgements
    pub cmd_port: u16,
    /// Host port for point stream frames
    pub data_port: u16,
}

impl HandshakeRequest {
    /// Encode the request payload carried after the command code
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(8);
        buf.put_slice(&self.host_ip.octets());
        buf.put_u16_le(self.cmd_port);
        buf.put_u16_le(self.data_port);
        buf.into()
    }

    /// Decode the request payload carried after the command code
    pub fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        need(&body, 8)?;
        let mut ip = [0; 4];
        body.copy_to_slice(&mut ip);
        Ok(Self {
            host_ip: Ipv4Addr::from(ip),
            cmd_port: body.get_u16_le(),
            data_port: body.get_u16_le(),
        })
    }
}

/// Payload of a successful handshake acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeAck {
    /// Protocol revision the session will use
    pub protocol: u8,
    /// Point encoding the device will stream
    pub point_format: PointFormat,
}

impl HandshakeAck {
    /// Encode the acknowledgement payload carried after the status byte
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.protocol, self.point_format as u8])
    }

    /// Decode the acknowledgement payload carried after the status byte
    pub fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        need(&body, 2)?;
        let protocol = body.get_u8();
        let format = body.get_u8();
        Ok(Self {
            protocol,
            point_format: PointFormat::from_u8(format).ok_or(WireError::UnknownFormat(format))?,
        })
    }
}

/// Payload of a device info acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfoAck {
    /// Firmware revision
    pub firmware: FirmwareVersion,
}

impl DeviceInfoAck {
    /// Encode the acknowledgement payload carried after the status byte
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.firmware.0)
    }

    /// Decode the acknowledgement payload carried after the status byte
    pub fn decode(mut body: &[u8]) -> Result<Self, WireError> {
        need(&body, 4)?;
        let mut fw = [0; 4];
        body.copy_to_slice(&mut fw);
        Ok(Self {
            firmware: FirmwareVersion(fw),
        })
    }
}
