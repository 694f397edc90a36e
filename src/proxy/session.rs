//! Per-client session state machine.
//!
//! A session owns the client connection, the upstream connection and the
//! request parser. It never performs I/O itself: [`Session::handle`] takes
//! one completion [`Event`] and returns the [`Effect`]s the reactor must
//! carry out. Exactly one event is handled at a time.
//!
//! ```text
//!   ReqStart ──► ReqParse ──► Connecting ──► Relaying
//!                  │  ▲           │              │
//!                  └──┘           │              │
//!            (need more data)     ▼              ▼
//!         any failure ──────────► Kill ──► AlmostDead{pending} ──► Dead
//! ```
//!
//! Teardown waits for every socket and timer handle the session owns to
//! report closure before the session is released.

use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::http::parser::{ParseError, ParseOutcome, ParserContext};
use crate::http::request::RequestHead;
use crate::proxy::connection::{Connection, Handle, Role, Status};
use crate::proxy::relay;
use crate::proxy::upstream::{RouteError, Target};

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Per-session settings derived from the server configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub buffer_size: usize,
    pub default_port: u16,
}

impl From<&Config> for SessionSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            idle_timeout: cfg.server.idle_timeout(),
            buffer_size: cfg.server.buffer_size,
            default_port: cfg.upstream.default_port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, first read not yet issued.
    ReqStart,
    /// Collecting the request head from the client.
    ReqParse,
    /// Waiting for the upstream connect to finish.
    Connecting,
    /// Pumping bytes both ways.
    Relaying,
    /// Teardown requested.
    Kill,
    /// Waiting for `pending` handle closures.
    AlmostDead { pending: usize },
    /// Every handle is closed; the session may be dropped.
    Dead,
}

/// Completion delivered by the reactor.
#[derive(Debug)]
pub enum Event {
    Read { role: Role, buf: BytesMut, status: Status },
    Write { role: Role, buf: BytesMut, status: Status },
    Timeout { role: Role },
    Connected,
    ConnectFailed(Status),
    Closed { role: Role, handle: Handle },
}

/// Operation the reactor must start on behalf of the session.
#[derive(Debug)]
pub enum Effect {
    /// Read into the spare capacity of `buf` and hand it back.
    Read { role: Role, buf: BytesMut },
    /// Write all of `buf` and hand it back.
    Write { role: Role, buf: BytesMut },
    /// (Re)start the idle timer of `role`.
    ArmTimer { role: Role, after: Duration },
    Connect { target: Target },
    /// Close the socket and timer of `role`, cancelling anything in flight.
    Close { role: Role },
    /// The session is dead and can be dropped.
    Release,
}

/// Why a session was torn down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    #[error("{role} {status}")]
    Io { role: Role, status: Status },
    #[error("request parse failed: {0}")]
    Parse(#[from] ParseError),
    #[error("no route: {0}")]
    Route(#[from] RouteError),
}

impl Failure {
    /// Orderly close by a peer rather than an actual error.
    pub fn is_eof(&self) -> bool {
        matches!(
            self,
            Failure::Io {
                status: Status::Eof,
                ..
            }
        )
    }
}

pub struct Session {
    id: u64,
    state: State,
    client: Connection,
    upstream: Connection,
    parser: ParserContext,
    /// Bytes of the client buffer already fed to the parser.
    parsed: usize,
    default_port: u16,
    head: Option<RequestHead>,
    target: Option<Target>,
    failure: Option<Failure>,
    history: Vec<State>,
    bytes_to_client: u64,
    bytes_to_upstream: u64,
}

impl Session {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            id: SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            state: State::ReqStart,
            client: Connection::new(Role::Client, settings.buffer_size, settings.idle_timeout),
            upstream: Connection::new(Role::Upstream, settings.buffer_size, settings.idle_timeout),
            parser: ParserContext::new(),
            parsed: 0,
            default_port: settings.default_port,
            head: None,
            target: None,
            failure: None,
            history: vec![State::ReqStart],
            bytes_to_client: 0,
            bytes_to_upstream: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Every state the session has been in, oldest first.
    pub fn history(&self) -> &[State] {
        &self.history
    }

    pub fn connection(&self, role: Role) -> &Connection {
        match role {
            Role::Client => &self.client,
            Role::Upstream => &self.upstream,
        }
    }

    pub fn head(&self) -> Option<&RequestHead> {
        self.head.as_ref()
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// First failure that triggered teardown, if any.
    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Bytes successfully written to `role`.
    pub fn bytes_written(&self, role: Role) -> u64 {
        match role {
            Role::Client => self.bytes_to_client,
            Role::Upstream => self.bytes_to_upstream,
        }
    }

    /// The accepted client socket is live: wait for the first request bytes.
    pub fn start(&mut self) -> Vec<Effect> {
        assert_eq!(self.state, State::ReqStart, "session started twice");
        let mut effects = Vec::new();
        self.client.attach();
        self.client.start_read(&mut effects);
        self.set_state(State::ReqParse);
        effects
    }

    /// Applies one completion event and returns the follow-up effects.
    ///
    /// # Panics
    ///
    /// Panics when called after the session reached [`State::Dead`], or when
    /// the event contradicts the connection state (e.g. a read completing
    /// that was never issued).
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        assert_ne!(self.state, State::Dead, "event {event:?} delivered to dead session {}", self.id);
        let mut effects = Vec::new();

        let result = match event {
            Event::Closed { role, handle } => {
                self.on_closed(role, handle, &mut effects);
                Ok(())
            }
            event if self.is_tearing_down() => {
                self.consume_late(event);
                Ok(())
            }
            Event::Read { role, buf, status } => {
                self.conn_mut(role).complete_read(buf, status);
                self.after_io(role, &mut effects)
            }
            Event::Write { role, buf, status } => {
                self.conn_mut(role).complete_write(status);
                if let Status::Ok(n) = status {
                    match role {
                        Role::Client => self.bytes_to_client += n as u64,
                        Role::Upstream => self.bytes_to_upstream += n as u64,
                    }
                }
                self.conn_mut(role.peer()).restore(buf);
                self.after_io(role, &mut effects)
            }
            Event::Timeout { role } => {
                self.conn_mut(role).expire();
                Err(Failure::Io {
                    role,
                    status: Status::Timeout,
                })
            }
            Event::Connected => self.on_connected(&mut effects),
            Event::ConnectFailed(status) => {
                assert_eq!(self.state, State::Connecting, "connect completed outside Connecting");
                Err(Failure::Io {
                    role: Role::Upstream,
                    status,
                })
            }
        };

        if let Err(failure) = result {
            self.fail(failure, &mut effects);
        }
        effects
    }

    fn after_io(&mut self, role: Role, effects: &mut Vec<Effect>) -> Result<(), Failure> {
        match self.state {
            State::ReqParse => {
                assert_eq!(role, Role::Client, "upstream I/O while parsing the request");
                self.on_request_data(effects)
            }
            State::Relaying => self.relay(effects),
            state => panic!("{role} completion in state {state:?}"),
        }
    }

    fn on_request_data(&mut self, effects: &mut Vec<Effect>) -> Result<(), Failure> {
        let status = self.client.last_result();
        if status.is_failure() {
            return Err(Failure::Io {
                role: Role::Client,
                status,
            });
        }

        let Some(buf) = self.client.buffered() else {
            unreachable!("client buffer away after a completed read");
        };
        let window = &buf[self.parsed..];
        let fed = window.len();
        let outcome = self.parser.feed(window)?;
        self.parsed += fed;

        match outcome {
            ParseOutcome::NeedMoreData => {
                self.client.keep_for_append();
                if !self.client.has_room() {
                    return Err(ParseError::HeadTooLarge.into());
                }
                self.client.start_read(effects);
                Ok(())
            }
            ParseOutcome::Ready { head, remainder } => {
                debug!(
                    method = %head.method,
                    uri = %head.target,
                    version = %head.version,
                    trailing = remainder,
                    "Request head ready"
                );
                let target = Target::from_head(&head, self.default_port)?;
                self.head = Some(head);

                self.upstream.attach();
                self.upstream.arm_timer(effects);
                effects.push(Effect::Connect {
                    target: target.clone(),
                });
                info!(upstream = %target, "Connecting to upstream");
                self.target = Some(target);
                self.set_state(State::Connecting);
                Ok(())
            }
        }
    }

    fn on_connected(&mut self, effects: &mut Vec<Effect>) -> Result<(), Failure> {
        assert_eq!(self.state, State::Connecting, "connect completed outside Connecting");
        self.set_state(State::Relaying);
        // The client buffer still holds the request; the first cycle
        // forwards it before the client is read again.
        self.relay(effects)
    }

    fn relay(&mut self, effects: &mut Vec<Effect>) -> Result<(), Failure> {
        relay::cycle(&mut self.client, &mut self.upstream, effects)?;
        relay::cycle(&mut self.upstream, &mut self.client, effects)
    }

    fn fail(&mut self, failure: Failure, effects: &mut Vec<Effect>) {
        if failure.is_eof() {
            debug!(reason = %failure, state = ?self.state, "Peer closed");
        } else {
            warn!(reason = %failure, state = ?self.state, "Session failed");
        }
        self.failure.get_or_insert(failure);
        self.kill(effects);
    }

    fn kill(&mut self, effects: &mut Vec<Effect>) {
        if self.is_tearing_down() {
            return;
        }
        self.set_state(State::Kill);

        let mut pending = 0;
        for conn in [&mut self.client, &mut self.upstream] {
            if conn.is_live() && !conn.is_dead() {
                pending += conn.request_close(effects);
            }
        }

        if pending == 0 {
            self.finish(effects);
        } else {
            self.set_state(State::AlmostDead { pending });
        }
    }

    fn on_closed(&mut self, role: Role, handle: Handle, effects: &mut Vec<Effect>) {
        let State::AlmostDead { pending } = self.state else {
            panic!("{role} {handle:?} closed in state {:?}", self.state);
        };
        self.conn_mut(role).closed(handle);
        trace!(%role, ?handle, pending = pending - 1, "Handle closed");

        if pending == 1 {
            self.finish(effects);
        } else {
            self.set_state(State::AlmostDead {
                pending: pending - 1,
            });
        }
    }

    fn finish(&mut self, effects: &mut Vec<Effect>) {
        self.set_state(State::Dead);
        let reason = self.failure.as_ref().map(|f| f.to_string()).unwrap_or_default();
        info!(
            to_upstream = self.bytes_to_upstream,
            to_client = self.bytes_to_client,
            reason = %reason,
            "Session closed"
        );
        effects.push(Effect::Release);
    }

    /// Completions that raced with teardown: the connection they belong to
    /// is already closed, so they only need to be drained.
    fn consume_late(&mut self, event: Event) {
        let role = match &event {
            Event::Read { role, .. } | Event::Write { role, .. } | Event::Timeout { role } => *role,
            Event::Connected | Event::ConnectFailed(_) => Role::Upstream,
            Event::Closed { .. } => unreachable!("closures are never late"),
        };
        let conn = self.conn_mut(role);
        assert!(
            conn.is_dead(),
            "{role} completion {event:?} during teardown on an open connection"
        );
        // The reactor drops a leg's timer on close, so this only arrives from
        // drivers whose timers outlive the close request.
        if let Event::Timeout { .. } = event {
            conn.expire();
        }
        trace!(%role, ?event, "Drained completion after close");
    }

    fn is_tearing_down(&self) -> bool {
        matches!(self.state, State::Kill | State::AlmostDead { .. } | State::Dead)
    }

    fn conn_mut(&mut self, role: Role) -> &mut Connection {
        match role {
            Role::Client => &mut self.client,
            Role::Upstream => &mut self.upstream,
        }
    }

    fn set_state(&mut self, next: State) {
        trace!(from = ?self.state, to = ?next, "Session state transition");
        self.state = next;
        self.history.push(next);
    }
}
