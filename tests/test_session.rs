//! Session lifecycle driven by a scripted reactor.

mod common;

use common::Harness;
use conduit::http::parser::ParseError;
use conduit::proxy::connection::{IoState, Role, Status};
use conduit::proxy::session::{Failure, State};
use std::io::ErrorKind;

const GET_ABSOLUTE: &[u8] = b"GET http://example.com:8080/ HTTP/1.1\r\n";

fn relaying() -> Harness {
    let mut h = Harness::started(128);
    h.read(Role::Client, GET_ABSOLUTE);
    h.connect_ok();
    h.write(Role::Upstream);
    assert_eq!(h.state(), State::Relaying);
    h
}

#[test]
fn test_start_issues_first_client_read() {
    let h = Harness::started(128);

    assert_eq!(h.state(), State::ReqParse);
    assert!(h.is_reading(Role::Client));
    assert!(!h.is_reading(Role::Upstream));
    assert_eq!(h.timers_armed.get(&Role::Client), Some(&1));
}

#[test]
fn test_absolute_target_connects_after_request_line() {
    let mut h = Harness::started(128);
    h.read(Role::Client, GET_ABSOLUTE);

    assert_eq!(h.state(), State::Connecting);
    let target = h.connecting.clone().unwrap();
    assert_eq!(target.host, "example.com");
    assert_eq!(target.port, 8080);
    assert!(!h.is_reading(Role::Client));
}

#[test]
fn test_request_fed_one_byte_at_a_time() {
    let request = b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n";
    let mut h = Harness::started(128);

    let mut fed = 0;
    while h.state() == State::ReqParse {
        h.read(Role::Client, &request[fed..fed + 1]);
        fed += 1;
    }

    assert_eq!(h.state(), State::Connecting);
    // Routing is decided on the Host line; the final CRLF is never needed.
    assert_eq!(fed, request.len() - 2);
    assert_eq!(h.reads_issued[&Role::Client], fed);

    let head = h.session.head().unwrap();
    assert_eq!(head.method, "GET");
    assert_eq!(head.target, "/foo");
    assert_eq!(head.version, "HTTP/1.1");
    assert_eq!(h.connecting.as_ref().unwrap().host, "x");
}

#[test]
fn test_url_in_query_routes_on_host_header() {
    let mut h = Harness::started(256);
    h.read(Role::Client, b"GET /r?u=http://a HTTP/1.1\r\nHost: up\r\n\r\n");

    assert_eq!(h.state(), State::Connecting);
    assert_eq!(h.session.failure(), None);
    let target = h.connecting.clone().unwrap();
    assert_eq!(target.host, "up");
    assert_eq!(target.port, 80);
}

#[test]
fn test_connected_session_forwards_request_before_reading_client() {
    let mut h = Harness::started(128);
    h.read(Role::Client, b"GET / HTTP/1.1\r\nHost: up\r\n\r\nbody");
    h.connect_ok();

    assert_eq!(h.state(), State::Relaying);
    assert!(h.is_writing(Role::Upstream));
    assert!(h.is_reading(Role::Upstream));
    assert!(!h.is_reading(Role::Client));

    h.write(Role::Upstream);
    assert_eq!(h.delivered_to(Role::Upstream), b"GET / HTTP/1.1\r\nHost: up\r\n\r\nbody");
    assert!(h.is_reading(Role::Client));
}

#[test]
fn test_relay_pumps_both_directions() {
    let mut h = relaying();

    h.read(Role::Upstream, b"HTTP/1.1 200 OK\r\n\r\n");
    assert!(h.is_writing(Role::Client));
    h.write(Role::Client);

    h.read(Role::Client, b"more");
    h.write(Role::Upstream);

    assert_eq!(h.delivered_to(Role::Client), b"HTTP/1.1 200 OK\r\n\r\n");
    assert!(h.delivered_to(Role::Upstream).ends_with(b"more"));
    assert_eq!(h.session.bytes_written(Role::Client), 19);
    assert!(h.is_reading(Role::Client));
    assert!(h.is_reading(Role::Upstream));
}

#[test]
fn test_slow_sink_holds_back_the_source() {
    let mut h = relaying();

    h.read(Role::Upstream, b"chunk-1");
    assert!(h.is_writing(Role::Client));
    assert!(!h.is_reading(Role::Upstream));

    // The client side keeps moving while the client write is stuck.
    h.read(Role::Client, b"ping");
    assert!(h.is_writing(Role::Upstream));
    h.write(Role::Upstream);
    assert!(h.is_reading(Role::Client));
    assert!(!h.is_reading(Role::Upstream));

    h.write(Role::Client);
    assert!(h.is_reading(Role::Upstream));
    assert_eq!(h.session.connection(Role::Upstream).read_state(), IoState::Busy);
}

#[test]
fn test_empty_method_kills_session_without_upstream() {
    let mut h = Harness::started(128);
    h.read(Role::Client, b" /foo HTTP/1.1\r\n");

    assert_eq!(h.session.failure(), Some(&Failure::Parse(ParseError::BadMethod)));
    assert_eq!(h.state(), State::AlmostDead { pending: 2 });
    assert!(!h.is_connecting());

    h.drain();
    assert_eq!(h.releases, 1);
    assert_eq!(
        h.session.history(),
        &[
            State::ReqStart,
            State::ReqParse,
            State::Kill,
            State::AlmostDead { pending: 2 },
            State::AlmostDead { pending: 1 },
            State::Dead,
        ]
    );
}

#[test]
fn test_upstream_connect_failure_tears_down_without_relaying() {
    let mut h = Harness::started(128);
    h.read(Role::Client, GET_ABSOLUTE);
    h.connect_fail(Status::Failed(ErrorKind::ConnectionRefused));
    h.drain();

    assert_eq!(h.releases, 1);
    assert!(h.reads_issued.get(&Role::Upstream).is_none());
    assert_eq!(
        h.session.history(),
        &[
            State::ReqStart,
            State::ReqParse,
            State::Connecting,
            State::Kill,
            State::AlmostDead { pending: 4 },
            State::AlmostDead { pending: 3 },
            State::AlmostDead { pending: 2 },
            State::AlmostDead { pending: 1 },
            State::Dead,
        ]
    );
}

#[test]
fn test_both_legs_idle_tear_down_once() {
    let mut h = relaying();

    h.timeout(Role::Client);
    h.timeout(Role::Upstream);
    h.drain();

    assert_eq!(h.releases, 1);
    assert_eq!(h.state(), State::Dead);
    assert_eq!(
        h.session.failure(),
        Some(&Failure::Io {
            role: Role::Client,
            status: Status::Timeout
        })
    );
    assert_eq!(h.session.connection(Role::Upstream).last_result(), Status::Timeout);
    assert_eq!(h.session.history().iter().filter(|s| **s == State::Kill).count(), 1);
}

#[test]
fn test_timeout_while_connecting() {
    let mut h = Harness::started(128);
    h.read(Role::Client, GET_ABSOLUTE);
    h.timeout(Role::Upstream);

    assert!(!h.is_connecting(), "pending connect must be cancelled");
    h.drain();
    assert_eq!(h.releases, 1);
}

#[test]
fn test_write_failure_closes_both_legs() {
    let mut h = relaying();
    h.read(Role::Upstream, b"data");
    h.fail_write(Role::Client, Status::Failed(ErrorKind::BrokenPipe));

    assert_eq!(h.state(), State::AlmostDead { pending: 4 });
    assert_eq!(h.session.connection(Role::Client).read_state(), IoState::Dead);
    assert_eq!(h.session.connection(Role::Upstream).write_state(), IoState::Dead);
    h.drain();
    assert_eq!(h.releases, 1);
}

#[test]
fn test_peer_eof_is_not_reported_as_error() {
    let mut h = relaying();
    h.read(Role::Upstream, b"");

    let failure = h.session.failure().unwrap();
    assert!(failure.is_eof());
    h.drain();
    assert_eq!(h.releases, 1);
}

#[test]
fn test_oversized_head_is_rejected() {
    let mut h = Harness::started(64);
    let mut line = b"GET /".to_vec();
    line.resize(64, b'a');
    h.read(Role::Client, &line);

    assert_eq!(h.session.failure(), Some(&Failure::Parse(ParseError::HeadTooLarge)));
}

#[test]
fn test_missing_host_is_a_route_failure() {
    let mut h = Harness::started(128);
    h.read(Role::Client, b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n");

    assert!(matches!(h.session.failure(), Some(Failure::Route(_))));
    h.drain();
    assert_eq!(h.releases, 1);
}

#[test]
#[should_panic(expected = "dead session")]
fn test_event_after_dead_is_rejected() {
    let mut h = Harness::started(128);
    h.read(Role::Client, b"");
    h.drain();
    assert_eq!(h.state(), State::Dead);

    h.timeout(Role::Client);
}

#[derive(Clone, Copy, Debug)]
enum Action {
    Read(Role),
    Write(Role),
    Connect,
    Queue,
}

fn random_bytes(rng: &mut fastrand::Rng, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.u8(..)).collect()
}

/// Random completion order with occasional injected failures. Every run
/// must end in exactly one release, and each direction must deliver a
/// prefix of what its source sent.
fn run_random(seed: u64) {
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut h = Harness::started(64);

    let mut client_stream = b"GET /x HTTP/1.1\r\nHost: up.example\r\n\r\n".to_vec();
    client_stream.extend(random_bytes(&mut rng, 300));
    let upstream_stream = random_bytes(&mut rng, 300);
    let mut sent = [0usize; 2];
    let faults = seed % 3 != 0;

    for _ in 0..10_000 {
        if h.is_released() {
            break;
        }

        let mut actions = Vec::new();
        for role in [Role::Client, Role::Upstream] {
            if h.is_reading(role) {
                actions.push(Action::Read(role));
            }
            if h.is_writing(role) {
                actions.push(Action::Write(role));
            }
        }
        if h.is_connecting() {
            actions.push(Action::Connect);
        }
        if h.has_queued() {
            actions.push(Action::Queue);
        }
        assert!(!actions.is_empty(), "seed {seed}: stalled in {:?}", h.state());

        let fault = faults && rng.u8(..100) < 2;
        if faults && rng.u16(..400) == 0 && h.session.connection(Role::Client).is_live() {
            let role = if rng.bool() { Role::Client } else { Role::Upstream };
            if !h.session.connection(role).is_dead() && h.session.connection(role).is_live() {
                h.timeout(role);
                continue;
            }
        }

        match actions[rng.usize(..actions.len())] {
            Action::Read(role) if fault => h.fail_read(role, Status::Failed(ErrorKind::ConnectionReset)),
            Action::Read(role) => {
                let (stream, idx) = match role {
                    Role::Client => (&client_stream, 0),
                    Role::Upstream => (&upstream_stream, 1),
                };
                let left = stream.len() - sent[idx];
                let n = rng.usize(1..=16).min(left).min(h.read_room(role));
                let chunk = stream[sent[idx]..sent[idx] + n].to_vec();
                sent[idx] += n;
                h.read(role, &chunk);
            }
            Action::Write(role) if fault => h.fail_write(role, Status::Failed(ErrorKind::BrokenPipe)),
            Action::Write(role) => h.write(role),
            Action::Connect if fault => h.connect_fail(Status::Failed(ErrorKind::ConnectionRefused)),
            Action::Connect => h.connect_ok(),
            Action::Queue => {
                h.step_queue();
            }
        }
    }

    assert_eq!(h.releases, 1, "seed {seed}: session not released exactly once");
    assert_eq!(h.state(), State::Dead);
    assert!(client_stream.starts_with(h.delivered_to(Role::Upstream)), "seed {seed}");
    assert!(upstream_stream.starts_with(h.delivered_to(Role::Client)), "seed {seed}");
}

#[test]
fn test_random_interleavings_always_terminate() {
    for seed in 0..300 {
        run_random(seed);
    }
}

#[test]
fn test_clean_run_relays_everything_before_eof() {
    // Without faults the client stream is fully forwarded: the session only
    // ends once a source has been drained and reported EOF.
    let mut h = relaying();
    let payload = b"0123456789abcdef";
    for _ in 0..8 {
        h.read(Role::Client, payload);
        h.write(Role::Upstream);
    }
    let mut expected = GET_ABSOLUTE.to_vec();
    for _ in 0..8 {
        expected.extend_from_slice(payload);
    }
    assert_eq!(h.delivered_to(Role::Upstream), &expected[..]);
    assert_eq!(h.session.bytes_written(Role::Upstream), expected.len() as u64);
}
