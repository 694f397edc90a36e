//! Scripted stand-in for the reactor: effects are recorded instead of
//! performed, and the test decides when and how each operation completes.

#![allow(dead_code)]

use bytes::BytesMut;
use conduit::proxy::connection::{Handle, Role, Status};
use conduit::proxy::session::{Effect, Event, Session, SessionSettings, State};
use conduit::proxy::upstream::Target;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

pub fn settings(buffer_size: usize) -> SessionSettings {
    SessionSettings {
        idle_timeout: Duration::from_millis(500),
        buffer_size,
        default_port: 80,
    }
}

pub struct Harness {
    pub session: Session,
    reads: HashMap<Role, BytesMut>,
    writes: HashMap<Role, BytesMut>,
    /// Payload read from a role and not yet written out to its peer.
    unflushed: HashMap<Role, bool>,
    pub connecting: Option<Target>,
    pub timers_armed: HashMap<Role, usize>,
    pub delivered: HashMap<Role, Vec<u8>>,
    pub reads_issued: HashMap<Role, usize>,
    pub releases: usize,
    queue: VecDeque<Event>,
}

impl Harness {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            session: Session::new(&settings(buffer_size)),
            reads: HashMap::new(),
            writes: HashMap::new(),
            unflushed: HashMap::new(),
            connecting: None,
            timers_armed: HashMap::new(),
            delivered: HashMap::new(),
            reads_issued: HashMap::new(),
            releases: 0,
            queue: VecDeque::new(),
        }
    }

    /// A harness whose session has issued its first client read.
    pub fn started(buffer_size: usize) -> Self {
        let mut h = Self::new(buffer_size);
        let effects = h.session.start();
        h.apply(effects);
        h
    }

    pub fn state(&self) -> State {
        self.session.state()
    }

    pub fn is_reading(&self, role: Role) -> bool {
        self.reads.contains_key(&role)
    }

    pub fn is_writing(&self, role: Role) -> bool {
        self.writes.contains_key(&role)
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.releases > 0
    }

    pub fn delivered_to(&self, role: Role) -> &[u8] {
        self.delivered.get(&role).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn deliver(&mut self, event: Event) {
        let effects = self.session.handle(event);
        self.apply(effects);
    }

    /// Completes the pending read on `role` with `data` (EOF when empty).
    pub fn read(&mut self, role: Role, data: &[u8]) {
        let mut buf = self.reads.remove(&role).expect("no read pending");
        let status = if data.is_empty() {
            Status::Eof
        } else {
            let room = buf.capacity() - buf.len();
            assert!(data.len() <= room, "test fed more than the buffer holds");
            buf.extend_from_slice(data);
            Status::Ok(data.len())
        };
        self.deliver(Event::Read { role, buf, status });
        if !data.is_empty() && matches!(self.state(), State::Connecting | State::Relaying) {
            self.unflushed.insert(role, true);
        }
    }

    pub fn fail_read(&mut self, role: Role, status: Status) {
        let buf = self.reads.remove(&role).expect("no read pending");
        self.deliver(Event::Read { role, buf, status });
    }

    /// Completes the pending write on `role` successfully.
    pub fn write(&mut self, role: Role) {
        let buf = self.writes.remove(&role).expect("no write pending");
        self.delivered
            .entry(role)
            .or_default()
            .extend_from_slice(&buf);
        self.unflushed.insert(role.peer(), false);
        let status = Status::Ok(buf.len());
        self.deliver(Event::Write { role, buf, status });
    }

    pub fn fail_write(&mut self, role: Role, status: Status) {
        let buf = self.writes.remove(&role).expect("no write pending");
        self.deliver(Event::Write { role, buf, status });
    }

    pub fn connect_ok(&mut self) {
        self.connecting.take().expect("no connect pending");
        self.deliver(Event::Connected);
    }

    pub fn connect_fail(&mut self, status: Status) {
        self.connecting.take().expect("no connect pending");
        self.deliver(Event::ConnectFailed(status));
    }

    pub fn timeout(&mut self, role: Role) {
        self.deliver(Event::Timeout { role });
    }

    /// Free space in the buffer of the pending read on `role`.
    pub fn read_room(&self, role: Role) -> usize {
        self.reads
            .get(&role)
            .map(|buf| buf.capacity() - buf.len())
            .unwrap_or(0)
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Delivers the oldest queued cancellation or closure.
    pub fn step_queue(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(event) => {
                self.deliver(event);
                true
            }
            None => false,
        }
    }

    /// Delivers queued cancellations and closures one at a time.
    pub fn drain(&mut self) {
        while let Some(event) = self.queue.pop_front() {
            self.deliver(event);
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Read { role, buf } => {
                    assert!(!self.reads.contains_key(&role), "{role} read issued while busy");
                    assert!(
                        !self.unflushed.get(&role).copied().unwrap_or(false),
                        "{role} read issued before its previous payload was flushed"
                    );
                    *self.reads_issued.entry(role).or_default() += 1;
                    self.reads.insert(role, buf);
                }
                Effect::Write { role, buf } => {
                    assert!(!self.writes.contains_key(&role), "{role} write issued while busy");
                    assert!(!buf.is_empty(), "empty write to {role}");
                    self.writes.insert(role, buf);
                }
                Effect::ArmTimer { role, .. } => {
                    *self.timers_armed.entry(role).or_default() += 1;
                }
                Effect::Connect { target } => {
                    assert!(self.connecting.is_none(), "second connect issued");
                    self.connecting = Some(target);
                }
                Effect::Close { role } => {
                    if self.reads.remove(&role).is_some() {
                        self.queue.push_back(Event::Read {
                            role,
                            buf: BytesMut::new(),
                            status: Status::Cancelled,
                        });
                    }
                    if self.writes.remove(&role).is_some() {
                        self.queue.push_back(Event::Write {
                            role,
                            buf: BytesMut::new(),
                            status: Status::Cancelled,
                        });
                    }
                    if role == Role::Upstream && self.connecting.take().is_some() {
                        self.queue.push_back(Event::ConnectFailed(Status::Cancelled));
                    }
                    self.queue.push_back(Event::Closed {
                        role,
                        handle: Handle::Socket,
                    });
                    self.queue.push_back(Event::Closed {
                        role,
                        handle: Handle::Timer,
                    });
                }
                Effect::Release => self.releases += 1,
            }
        }
    }
}
