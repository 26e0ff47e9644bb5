use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use super::*;
use crate::wire::codes;

mod util;
use util::*;

#[test]
fn discovery_registers_device_once() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let first = pair.announce().unwrap();
    let again = pair.announce().unwrap();
    assert_eq!(first, again);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [Event::DeviceFound { handle, summary }]
            if *handle == first
                && summary.serial == pair.device.serial
                && summary.state == State::Discovered
    );
    assert_eq!(pair.endpoint.stats().devices_seen, 1);
    assert_eq!(pair.endpoint.stats().announcements, 2);
    assert_eq!(pair.endpoint.devices().len(), 1);
}

#[test]
fn devices_are_keyed_by_serial() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let a = pair.announce().unwrap();
    let mut second = SimDevice::new(41);
    let announcement = second.announcement();
    let b = pair
        .endpoint
        .handle_discovery_datagram(pair.time, second.announce_source(), &announcement)
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(pair.endpoint.devices().len(), 2);

    // The same serial announcing from a new address is still the same device
    pair.device.ip = Ipv4Addr::new(192, 168, 1, 50);
    assert_eq!(pair.announce(), Some(a));
    assert_eq!(pair.endpoint.devices().len(), 2);
    assert_eq!(
        pair.endpoint.device(a).unwrap().address,
        "192.168.1.50:56100".parse().unwrap()
    );
}

#[test]
fn garbage_on_discovery_socket_is_dropped() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let source = pair.device.announce_source();
    assert_eq!(
        pair.endpoint
            .handle_discovery_datagram(pair.time, source, &[0xaa, 0x01, 0x03]),
        None
    );
    let mut corrupt = pair.device.announcement();
    corrupt[5] ^= 0xff;
    assert_eq!(
        pair.endpoint
            .handle_discovery_datagram(pair.time, source, &corrupt),
        None
    );
    assert_eq!(pair.endpoint.stats().bad_announcements, 2);
    assert_eq!(pair.endpoint.stats().devices_seen, 0);
    assert!(pair.events().is_empty());
}

#[test]
fn handshake_carries_sequence_one_and_host_ports() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.announce().unwrap();
    pair.connect(handle);
    assert_eq!(pair.state(handle), State::Handshaking);
    assert_eq!(pair.drive(handle), 1);
    let (seq, request) = pair.device.inbox.pop().unwrap();
    assert_eq!(seq, 1);
    assert_eq!(request.code, codes::HANDSHAKE);
    let hello = wire::HandshakeRequest::decode(&request.body).unwrap();
    assert_eq!(hello.host_ip, HOST.ip);
    assert_eq!(hello.cmd_port, HOST.cmd_port);
    assert_eq!(hello.data_port, HOST.data_port);
}

#[test]
fn connect_emits_ordered_state_changes() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.announce().unwrap();
    pair.connect(handle);
    pair.drive(handle);
    let (seq, _) = pair.device.inbox.pop().unwrap();
    let ack = pair.device.handshake_ack(seq);
    pair.recv_command(handle, &ack);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [
            Event::DeviceFound { .. },
            Event::StateChanged {
                old: State::Discovered,
                new: State::Handshaking,
                ..
            },
            Event::StateChanged {
                old: State::Handshaking,
                new: State::Connected,
                ..
            },
        ]
    );
}

#[test]
fn session_setup_negotiates_and_queries_firmware() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    let summary = pair.endpoint.device(handle).unwrap();
    assert_eq!(summary.state, State::Connected);
    let session = summary.session.unwrap();
    assert_eq!(session.protocol, pair.device.protocol);
    assert_eq!(session.point_format, PointFormat::Cartesian);
    assert_eq!(session.firmware, Some(pair.device.firmware));
}

#[test]
fn command_times_out_after_constant_interval_retries() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    let start = pair.time;
    let token = pair
        .endpoint
        .send_command(
            pair.time,
            handle,
            0x0102,
            Bytes::new(),
            Some(Duration::from_millis(100)),
        )
        .unwrap();
    assert_eq!(pair.drive(handle), 1);
    let (seq, _) = pair.device.inbox.pop().unwrap();

    // Two retransmissions at the constant interval, same sequence number
    assert_eq!(pair.step_to_deadline(), Duration::from_millis(100));
    assert_eq!(pair.drive(handle), 1);
    assert_eq!(pair.device.inbox.pop().unwrap().0, seq);
    assert_eq!(pair.step_to_deadline(), Duration::from_millis(100));
    assert_eq!(pair.drive(handle), 1);
    assert_eq!(pair.device.inbox.pop().unwrap().0, seq);

    // The third expiry retires the request
    assert_eq!(pair.step_to_deadline(), Duration::from_millis(100));
    assert_eq!(pair.drive(handle), 0);
    assert_eq!(pair.time - start, Duration::from_millis(300));
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [Event::CommandComplete {
            token: t,
            result: Err(CommandError::TimedOut),
            ..
        }] if *t == token
    );
    assert_eq!(pair.endpoint.device_inner(handle).unwrap().outstanding_commands(), 0);
}

#[test]
fn late_ack_after_timeout_is_stale() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    pair.endpoint
        .send_command(
            pair.time,
            handle,
            0x0102,
            Bytes::new(),
            Some(Duration::from_millis(100)),
        )
        .unwrap();
    pair.drive(handle);
    let (seq, request) = pair.device.inbox.pop().unwrap();
    for _ in 0..3 {
        pair.step_to_deadline();
    }
    pair.drive(handle);
    pair.device.inbox.clear();
    assert_eq!(pair.events().len(), 1);

    // The answer arrives after the retry budget already gave up
    let ack = pair.device.ack(seq, request.code, 0, Bytes::new());
    pair.recv_command(handle, &ack);
    assert!(pair.events().is_empty());
    assert_eq!(pair.endpoint.device_inner(handle).unwrap().stale_acks(), 1);
}

#[test]
fn duplicate_ack_completes_once() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    let token = pair
        .endpoint
        .send_command(pair.time, handle, 0x0102, Bytes::new(), None)
        .unwrap();
    pair.drive(handle);
    let (seq, request) = pair.device.inbox.pop().unwrap();
    let ack = pair.device.ack(seq, request.code, 0, Bytes::new());
    pair.recv_command(handle, &ack);
    pair.recv_command(handle, &ack);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [Event::CommandComplete { token: t, result: Ok(_), .. }] if *t == token
    );
    assert_eq!(pair.endpoint.device_inner(handle).unwrap().stale_acks(), 1);
}

#[test]
fn outstanding_commands_use_distinct_sequences() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    let first = pair
        .endpoint
        .send_command(pair.time, handle, 0x0102, Bytes::new(), None)
        .unwrap();
    let second = pair
        .endpoint
        .send_command(pair.time, handle, 0x0103, Bytes::new(), None)
        .unwrap();
    assert_eq!(pair.drive(handle), 2);
    let (seq_b, req_b) = pair.device.inbox.pop().unwrap();
    let (seq_a, req_a) = pair.device.inbox.pop().unwrap();
    assert_ne!(seq_a, seq_b);

    // Completion order follows the device, not submission order
    let ack = pair.device.ack(seq_b, req_b.code, 0, Bytes::new());
    pair.recv_command(handle, &ack);
    let ack = pair.device.ack(seq_a, req_a.code, 0, Bytes::new());
    pair.recv_command(handle, &ack);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [
            Event::CommandComplete { token: t1, result: Ok(_), .. },
            Event::CommandComplete { token: t2, result: Ok(_), .. },
        ] if *t1 == second && *t2 == first
    );
}

#[test]
fn nonzero_status_still_completes() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    let token = pair
        .endpoint
        .send_command(pair.time, handle, 0x0102, Bytes::new(), None)
        .unwrap();
    pair.drive(handle);
    let (seq, request) = pair.device.inbox.pop().unwrap();
    let ack = pair.device.ack(seq, request.code, 7, Bytes::new());
    pair.recv_command(handle, &ack);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [Event::CommandComplete { token: t, result: Ok(ack), .. }]
            if *t == token && ack.status == 7 && !ack.ok()
    );
}

#[test]
fn oversized_command_body_is_refused() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    let body = Bytes::from(vec![0; wire::MAX_COMMAND_BODY + 1]);
    assert_matches!(
        pair.endpoint.send_command(pair.time, handle, 0x00f1, body, None),
        Err(SendError::TooLarge)
    );
    assert_eq!(pair.drive(handle), 0);
    assert!(pair.events().is_empty());
    assert_eq!(pair.endpoint.stats().commands_issued, 0);

    // The largest permitted body exactly fills the length field
    let body = Bytes::from(vec![0; wire::MAX_COMMAND_BODY]);
    pair.endpoint
        .send_command(pair.time, handle, 0x00f1, body, None)
        .unwrap();
    assert_eq!(pair.drive(handle), 1);
    let (_, request) = pair.device.inbox.pop().unwrap();
    assert_eq!(request.body.len(), wire::MAX_COMMAND_BODY);
}

#[test]
fn command_backlog_is_bounded() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    for _ in 0..MAX_PENDING_COMMANDS {
        pair.endpoint
            .send_command(pair.time, handle, 0x0102, Bytes::new(), None)
            .unwrap();
    }
    assert_matches!(
        pair.endpoint
            .send_command(pair.time, handle, 0x0102, Bytes::new(), None),
        Err(SendError::Backlogged)
    );
    assert_eq!(pair.drive(handle), MAX_PENDING_COMMANDS);

    // Room opens up as soon as the device answers one
    let (seq, request) = pair.device.inbox.pop().unwrap();
    let ack = pair.device.ack(seq, request.code, 0, Bytes::new());
    pair.recv_command(handle, &ack);
    assert_eq!(pair.events().len(), 1);
    pair.endpoint
        .send_command(pair.time, handle, 0x0102, Bytes::new(), None)
        .unwrap();
    assert_eq!(pair.drive(handle), 1);
}

#[test]
fn huge_timeout_override_is_clamped() {
    let _guard = subscribe();
    let mut config = Config::default();
    config
        .announce_interval(Duration::from_secs(100_000))
        .keepalive_interval(None);
    let mut pair = Pair::new(config);
    let handle = pair.establish();
    let token = pair
        .endpoint
        .send_command(pair.time, handle, 0x0102, Bytes::new(), Some(Duration::MAX))
        .unwrap();
    assert_eq!(pair.drive(handle), 1);
    let (seq, _) = pair.device.inbox.pop().unwrap();

    // Each wait runs the clamped interval, not the requested eternity
    assert_eq!(pair.step_to_deadline(), MAX_COMMAND_TIMEOUT);
    assert_eq!(pair.drive(handle), 1);
    assert_eq!(pair.device.inbox.pop().unwrap().0, seq);
    assert_eq!(pair.step_to_deadline(), MAX_COMMAND_TIMEOUT);
    assert_eq!(pair.drive(handle), 1);
    assert_eq!(pair.device.inbox.pop().unwrap().0, seq);
    assert_eq!(pair.step_to_deadline(), MAX_COMMAND_TIMEOUT);
    assert_eq!(pair.drive(handle), 0);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [Event::CommandComplete {
            token: t,
            result: Err(CommandError::TimedOut),
            ..
        }] if *t == token
    );
}

#[test]
fn ack_from_unexpected_source_is_stale() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    let token = pair
        .endpoint
        .send_command(pair.time, handle, 0x0102, Bytes::new(), None)
        .unwrap();
    pair.drive(handle);
    let (seq, request) = pair.device.inbox.pop().unwrap();
    let ack = pair.device.ack(seq, request.code, 0, Bytes::new());

    // Same device IP but not the announced command port
    let elsewhere = SocketAddr::new(IpAddr::V4(pair.device.ip), pair.device.cmd_port + 7);
    pair.endpoint
        .handle_command_datagram(pair.time, handle, elsewhere, &ack);
    assert!(pair.events().is_empty());
    assert_eq!(pair.endpoint.device_inner(handle).unwrap().stale_acks(), 1);

    // From the announced address the same datagram completes the command
    pair.recv_command(handle, &ack);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [Event::CommandComplete { token: t, result: Ok(_), .. }] if *t == token
    );
}

#[test]
fn silent_device_is_lost_then_pruned() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    let token = pair
        .endpoint
        .send_command(
            pair.time,
            handle,
            0x0102,
            Bytes::new(),
            Some(Duration::from_secs(10)),
        )
        .unwrap();
    pair.drive(handle);
    pair.device.inbox.clear();

    // Three announce intervals of silence
    pair.step(Duration::from_secs(3));
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [
            Event::CommandComplete {
                token: t,
                result: Err(CommandError::DeviceLost),
                ..
            },
            Event::DeviceLost {
                reason: LostReason::AnnouncementsStopped,
                ..
            },
            Event::StateChanged {
                new: State::Disconnected,
                ..
            },
        ] if *t == token
    );
    assert_eq!(pair.state(handle), State::Disconnected);

    // The registry entry survives for the grace period, then goes away
    pair.step(Duration::from_secs(5));
    let events = pair.events();
    assert_matches!(events.as_slice(), [Event::DeviceRemoved { handle: h }] if *h == handle);
    assert!(pair.endpoint.device(handle).is_none());
    assert!(pair.endpoint.devices().is_empty());
}

#[test]
fn reannouncement_revives_disconnected_device() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    pair.endpoint.disconnect(pair.time, handle).unwrap();
    assert_eq!(pair.drive(handle), 1);
    let (_, request) = pair.device.inbox.pop().unwrap();
    assert_eq!(request.code, codes::DISCONNECT);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [Event::StateChanged {
            old: State::Connected,
            new: State::Disconnected,
            ..
        }]
    );

    assert_eq!(pair.announce(), Some(handle));
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [Event::StateChanged {
            old: State::Disconnected,
            new: State::Discovered,
            ..
        }]
    );

    // Kept alive by announcements well past the prune grace period
    for _ in 0..6 {
        pair.step(Duration::from_secs(1));
        pair.announce();
    }
    assert_eq!(pair.state(handle), State::Discovered);
    assert!(pair.events().is_empty());
}

#[test]
fn address_change_resets_active_session() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    pair.device.ip = Ipv4Addr::new(192, 168, 1, 41);
    assert_eq!(pair.announce(), Some(handle));
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [
            Event::StateChanged {
                old: State::Connected,
                new: State::Disconnected,
                ..
            },
            Event::StateChanged {
                old: State::Disconnected,
                new: State::Discovered,
                ..
            },
        ]
    );
    assert_eq!(
        pair.endpoint.device(handle).unwrap().address,
        "192.168.1.41:56100".parse().unwrap()
    );
}

#[test]
fn frames_only_count_while_sampling() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    let frame = pair.device.frame(1_000, 3);
    pair.recv_data(handle, &frame);
    assert_eq!(pair.stats(handle).not_sampling, 1);
    assert!(pair.events().is_empty());
    assert!(!pair.endpoint.device_inner(handle).unwrap().data_lane_open());

    pair.begin_sampling(handle);
    assert!(pair.endpoint.device_inner(handle).unwrap().data_lane_open());
    let frame = pair.device.frame(2_000, 3);
    pair.recv_data(handle, &frame);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [Event::Frame { frame, .. }]
            if frame.timestamp_us == 2_000 && frame.points.len() == 3
    );
    let stats = pair.stats(handle);
    assert_eq!((stats.frames, stats.points), (1, 3));
}

#[test]
fn sampling_rejection_stays_connected() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    pair.endpoint.start_sampling(pair.time, handle).unwrap();
    assert_matches!(
        pair.endpoint.start_sampling(pair.time, handle),
        Err(SamplingError::RequestPending)
    );
    pair.drive(handle);
    let (seq, _) = pair.device.inbox.pop().unwrap();
    let ack = pair.device.ack(seq, codes::START_SAMPLING, 2, Bytes::new());
    pair.recv_command(handle, &ack);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [Event::SamplingRejected {
            error: CommandError::Rejected(2),
            ..
        }]
    );
    assert_eq!(pair.state(handle), State::Connected);
    assert!(!pair.endpoint.device_inner(handle).unwrap().data_lane_open());
}

#[test]
fn garbled_frames_are_counted_not_fatal() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    pair.begin_sampling(handle);
    let good = pair.device.frame(7, 2);

    let mut bad_sof = good.clone();
    bad_sof[0] = 0x55;
    pair.recv_data(handle, &bad_sof);

    // Claims one more point than the datagram carries
    let mut claims_more = good.clone();
    claims_more[18] += 1;
    pair.recv_data(handle, &claims_more);

    let mut unknown_format = good.clone();
    unknown_format[17] = 9;
    pair.recv_data(handle, &unknown_format);

    let mut padded = good.to_vec();
    padded.push(0);
    pair.recv_data(handle, &padded);

    pair.endpoint.handle_data_datagram(
        pair.time,
        handle,
        "192.168.1.77:56101".parse().unwrap(),
        &good,
    );

    let stray_ack = pair.device.ack(1, codes::KEEPALIVE, 0, Bytes::new());
    pair.recv_data(handle, &stray_ack);

    pair.recv_data(handle, &good);
    let stats = pair.stats(handle);
    assert_eq!(stats.bad_header, 1);
    assert_eq!(stats.truncated, 1);
    assert_eq!(stats.unknown_format, 1);
    assert_eq!(stats.bad_length, 1);
    assert_eq!(stats.stale_source, 1);
    assert_eq!(stats.unexpected_family, 1);
    assert_eq!((stats.frames, stats.points), (1, 2));
    assert_eq!(pair.state(handle), State::Sampling);
    let events = pair.events();
    assert_matches!(events.as_slice(), [Event::Frame { .. }]);
}

#[test]
fn stalled_stream_disconnects() {
    let _guard = subscribe();
    let mut cfg = Config::default();
    cfg.keepalive_interval(None);
    let mut pair = Pair::new(cfg);
    let handle = pair.establish();
    pair.begin_sampling(handle);

    pair.step(Duration::from_secs(1));
    pair.announce();
    let frame = pair.device.frame(10, 1);
    pair.recv_data(handle, &frame);
    pair.step(Duration::from_secs(1));
    pair.announce();
    pair.events();

    // Two windows of silence after the last good frame
    pair.step(Duration::from_secs(1));
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [
            Event::DeviceLost {
                reason: LostReason::DataStalled,
                ..
            },
            Event::StateChanged {
                old: State::Sampling,
                new: State::Disconnected,
                ..
            },
        ]
    );
    assert!(!pair.endpoint.device_inner(handle).unwrap().data_lane_open());
    assert!(!pair.endpoint.device_inner(handle).unwrap().command_lane_open());
}

#[test]
fn keepalive_misses_disconnect() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    let start = pair.time;

    let mut lost = None;
    for _ in 0..4 {
        pair.announce();
        pair.step(Duration::from_secs(1));
        pair.drive(handle);
        if let Some(reason) = pair.events().iter().find_map(|e| match e {
            Event::DeviceLost { reason, .. } => Some(*reason),
            _ => None,
        }) {
            lost = Some(reason);
            break;
        }
    }
    assert_eq!(lost, Some(LostReason::KeepaliveTimeout));
    assert_eq!(pair.time - start, Duration::from_secs(4));
    assert_eq!(pair.device.inbox.len(), 3);
    assert!(pair.device.inbox.iter().all(|(_, r)| r.code == codes::KEEPALIVE));
    assert_eq!(pair.state(handle), State::Disconnected);
}

#[test]
fn keepalive_ack_resets_misses() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    let start = pair.time;

    for second in 1..=7 {
        pair.announce();
        pair.step(Duration::from_secs(1));
        pair.drive(handle);
        if second == 3 {
            // Answer the third probe; earlier misses are forgotten
            let (seq, request) = pair.device.inbox.pop().unwrap();
            assert_eq!(request.code, codes::KEEPALIVE);
            let ack = pair.device.ack(seq, codes::KEEPALIVE, 0, Bytes::new());
            pair.recv_command(handle, &ack);
        }
        if second < 7 {
            assert_eq!(pair.state(handle), State::Connected, "lost at {second}s");
        }
    }
    assert_eq!(pair.state(handle), State::Disconnected);
    assert_eq!(pair.time - start, Duration::from_secs(7));
    assert!(pair
        .events()
        .iter()
        .any(|e| matches!(e, Event::DeviceLost { reason: LostReason::KeepaliveTimeout, .. })));
}

#[test]
fn handshake_gives_up_after_cycles() {
    let _guard = subscribe();
    let mut cfg = Config::default();
    cfg.announce_interval(Duration::from_secs(10));
    let mut pair = Pair::new(cfg);
    let handle = pair.announce().unwrap();
    pair.connect(handle);
    let start = pair.time;

    let mut transmissions = pair.drive(handle);
    let mut lost = None;
    for _ in 0..16 {
        if let Some(reason) = pair.events().iter().find_map(|e| match e {
            Event::DeviceLost { reason, .. } => Some(*reason),
            _ => None,
        }) {
            lost = Some(reason);
            break;
        }
        pair.step_to_deadline();
        transmissions += pair.drive(handle);
    }
    assert_eq!(lost, Some(LostReason::HandshakeFailed));
    // Three full cycles of initial send plus two retries, half a second apart
    assert_eq!(transmissions, 9);
    assert_eq!(pair.time - start, Duration::from_millis(4500));
    let seqs: Vec<u16> = pair.device.inbox.iter().map(|&(seq, _)| seq).collect();
    assert_eq!(seqs, [1, 1, 1, 2, 2, 2, 3, 3, 3]);
    assert!(pair.device.inbox.iter().all(|(_, r)| r.code == codes::HANDSHAKE));
    assert_eq!(pair.state(handle), State::Disconnected);
}

#[test]
fn disconnect_cancels_outstanding_commands() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    let token = pair
        .endpoint
        .send_command(pair.time, handle, 0x0102, Bytes::new(), None)
        .unwrap();
    pair.drive(handle);
    pair.device.inbox.clear();

    pair.endpoint.disconnect(pair.time, handle).unwrap();
    assert_eq!(pair.drive(handle), 1);
    let (_, request) = pair.device.inbox.pop().unwrap();
    assert_eq!(request.code, codes::DISCONNECT);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [
            Event::CommandComplete {
                token: t,
                result: Err(CommandError::Cancelled),
                ..
            },
            Event::StateChanged {
                new: State::Disconnected,
                ..
            },
        ] if *t == token
    );
    assert!(!pair.endpoint.device_inner(handle).unwrap().command_lane_open());
}

#[test]
fn stop_sampling_ends_the_session() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    pair.begin_sampling(handle);

    pair.endpoint.stop_sampling(pair.time, handle).unwrap();
    assert_eq!(pair.drive(handle), 1);
    let (_, request) = pair.device.inbox.pop().unwrap();
    assert_eq!(request.code, codes::STOP_SAMPLING);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [Event::StateChanged {
            old: State::Sampling,
            new: State::Disconnected,
            ..
        }]
    );
    assert!(!pair.endpoint.device_inner(handle).unwrap().data_lane_open());
    assert!(!pair.endpoint.device_inner(handle).unwrap().command_lane_open());

    // A stopped session needs rediscovery before sampling again
    assert_matches!(
        pair.endpoint.start_sampling(pair.time, handle),
        Err(SamplingError::InvalidState(State::Disconnected))
    );
    assert_eq!(pair.announce(), Some(handle));
    assert_eq!(pair.state(handle), State::Discovered);
}

#[test]
fn shutdown_cancels_and_quiesces() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let handle = pair.establish();
    pair.begin_sampling(handle);
    let token = pair
        .endpoint
        .send_command(pair.time, handle, 0x0102, Bytes::new(), None)
        .unwrap();
    pair.drive(handle);
    pair.device.inbox.clear();

    pair.endpoint.shutdown(pair.time);
    assert_eq!(pair.drive(handle), 1);
    let (_, request) = pair.device.inbox.pop().unwrap();
    assert_eq!(request.code, codes::DISCONNECT);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [
            Event::CommandComplete {
                token: t,
                result: Err(CommandError::Cancelled),
                ..
            },
            Event::StateChanged {
                old: State::Sampling,
                new: State::Disconnected,
                ..
            },
        ] if *t == token
    );

    // Quiescent: no further events, and announcements fall on deaf ears
    assert!(pair.endpoint.poll_event().is_none());
    assert_eq!(pair.announce(), None);
    assert!(pair.endpoint.poll_event().is_none());
    assert_eq!(pair.state(handle), State::Disconnected);
}

#[test]
fn backoff_factor_grows_retry_interval() {
    let _guard = subscribe();
    let mut cfg = Config::default();
    cfg.backoff_factor(2);
    let mut pair = Pair::new(cfg);
    let handle = pair.establish();
    pair.endpoint
        .send_command(
            pair.time,
            handle,
            0x0102,
            Bytes::new(),
            Some(Duration::from_millis(100)),
        )
        .unwrap();
    assert_eq!(pair.drive(handle), 1);

    assert_eq!(pair.step_to_deadline(), Duration::from_millis(100));
    assert_eq!(pair.drive(handle), 1);
    assert_eq!(pair.step_to_deadline(), Duration::from_millis(200));
    assert_eq!(pair.drive(handle), 1);
    assert_eq!(pair.step_to_deadline(), Duration::from_millis(400));
    assert_eq!(pair.drive(handle), 0);
    let events = pair.events();
    assert_matches!(
        events.as_slice(),
        [Event::CommandComplete {
            result: Err(CommandError::TimedOut),
            ..
        }]
    );
}

#[test]
fn requests_require_the_right_state() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let bogus = DeviceHandle(9);
    assert_matches!(
        pair.endpoint.connect(pair.time, bogus, HOST),
        Err(ConnectError::UnknownDevice)
    );
    assert_matches!(
        pair.endpoint
            .send_command(pair.time, bogus, 0x0102, Bytes::new(), None),
        Err(SendError::UnknownDevice)
    );
    assert_matches!(
        pair.endpoint.start_sampling(pair.time, bogus),
        Err(SamplingError::UnknownDevice)
    );

    let handle = pair.announce().unwrap();
    assert_matches!(
        pair.endpoint
            .send_command(pair.time, handle, 0x0102, Bytes::new(), None),
        Err(SendError::NotConnected(State::Discovered))
    );
    assert_matches!(
        pair.endpoint.start_sampling(pair.time, handle),
        Err(SamplingError::InvalidState(State::Discovered))
    );
    assert_matches!(
        pair.endpoint.disconnect(pair.time, handle),
        Err(ConnectError::InvalidState(State::Discovered))
    );

    pair.connect(handle);
    assert_matches!(
        pair.endpoint.connect(pair.time, handle, HOST),
        Err(ConnectError::InvalidState(State::Handshaking))
    );
}
