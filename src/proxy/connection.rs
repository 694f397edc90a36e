//! One leg of a session: a socket, its idle timer and its single buffer.
//!
//! A connection is two small state machines, one for reading and one for
//! writing. Each is idle (`Stop`), has an operation in flight (`Busy`), or
//! has just completed one (`Done`). `Dead` is terminal and only reached
//! during teardown.
//!
//! ```text
//!             Busy                       Done                 Stop
//!  read    |  waiting for incoming data | holds incoming data | idle
//!  write   |  writing out a payload     | write finished      | idle
//! ```
//!
//! Reads are discrete: a completed read is not followed by another until
//! someone asks for it, because the buffer it filled must first be written
//! out by the peer.
//!
//! The connection performs no I/O. Starting an operation pushes an
//! [`Effect`] for the reactor, and completions come back through the
//! `complete_*` methods.

use bytes::BytesMut;
use std::fmt;
use std::io;
use std::time::Duration;

use crate::proxy::session::Effect;

/// Which side of the session a connection faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Upstream,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Upstream,
            Role::Upstream => Role::Client,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Upstream => f.write_str("upstream"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    Stop,
    Busy,
    Done,
    Dead,
}

/// Result of the most recent operation on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Bytes transferred.
    Ok(usize),
    /// Peer closed its end.
    Eof,
    /// The idle timer fired.
    Timeout,
    /// The operation was abandoned because the connection was closed.
    Cancelled,
    Failed(io::ErrorKind),
}

impl Status {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Status::Ok(_))
    }
}

impl From<&io::Error> for Status {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Status::Eof,
            kind => Status::Failed(kind),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok(n) => write!(f, "ok ({n} bytes)"),
            Status::Eof => f.write_str("end of stream"),
            Status::Timeout => f.write_str("idle timeout"),
            Status::Cancelled => f.write_str("cancelled"),
            Status::Failed(kind) => write!(f, "{kind}"),
        }
    }
}

/// Asynchronous handles a connection owns; each reports its own closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handle {
    Socket,
    Timer,
}

/// Where the connection's buffer currently is.
#[derive(Debug)]
enum Slot {
    /// At home, possibly holding bytes kept for the next read to append to.
    Idle(BytesMut),
    /// Handed to the reactor for an in-flight read.
    Reading,
    /// Holding the payload of a completed read.
    Filled(BytesMut),
    /// Lent to the peer, which is writing it out.
    Lent,
}

#[derive(Debug)]
pub struct Connection {
    role: Role,
    read_state: IoState,
    write_state: IoState,
    slot: Slot,
    capacity: usize,
    last_result: Status,
    idle_timeout: Duration,
    /// Socket and timer handles not yet reported closed.
    open_handles: u8,
}

impl Connection {
    pub fn new(role: Role, capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            role,
            read_state: IoState::Stop,
            write_state: IoState::Stop,
            slot: Slot::Idle(BytesMut::with_capacity(capacity)),
            capacity,
            last_result: Status::Ok(0),
            idle_timeout,
            open_handles: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn read_state(&self) -> IoState {
        self.read_state
    }

    pub fn write_state(&self) -> IoState {
        self.write_state
    }

    pub fn last_result(&self) -> Status {
        self.last_result
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True while the socket or timer handle is open.
    pub fn is_live(&self) -> bool {
        self.open_handles > 0
    }

    pub fn is_dead(&self) -> bool {
        self.read_state == IoState::Dead
    }

    /// Bytes the buffer holds, when it is at home.
    pub fn buffered(&self) -> Option<&[u8]> {
        match &self.slot {
            Slot::Idle(buf) | Slot::Filled(buf) => Some(buf),
            Slot::Reading | Slot::Lent => None,
        }
    }

    /// Records that the socket and timer handles now exist.
    pub fn attach(&mut self) {
        assert_eq!(self.open_handles, 0, "{} connection attached twice", self.role);
        self.open_handles = 2;
    }

    /// Issues a read into the spare capacity of the buffer. Bytes already
    /// held are kept and the new data is appended after them.
    pub fn start_read(&mut self, effects: &mut Vec<Effect>) {
        assert_eq!(self.read_state, IoState::Stop, "{} read issued while not stopped", self.role);
        let buf = match std::mem::replace(&mut self.slot, Slot::Reading) {
            Slot::Idle(buf) => buf,
            other => panic!("{} read issued while buffer is {:?}", self.role, other),
        };
        assert!(buf.len() < self.capacity, "{} read issued with a full buffer", self.role);

        self.read_state = IoState::Busy;
        effects.push(Effect::Read { role: self.role, buf });
        self.arm_timer(effects);
    }

    /// Takes back the buffer from a finished read.
    pub fn complete_read(&mut self, buf: BytesMut, status: Status) {
        assert_eq!(self.read_state, IoState::Busy, "{} read completed while not busy", self.role);
        self.read_state = IoState::Done;
        self.slot = Slot::Filled(buf);
        self.last_result = status;
    }

    /// Keeps the filled buffer at home and allows another read to append to
    /// it. Used while a request head is still being collected.
    pub fn keep_for_append(&mut self) {
        assert_eq!(self.read_state, IoState::Done, "{} has no completed read", self.role);
        self.slot = match std::mem::replace(&mut self.slot, Slot::Reading) {
            Slot::Filled(buf) => Slot::Idle(buf),
            other => panic!("{} buffer is {:?}, expected filled", self.role, other),
        };
        self.read_state = IoState::Stop;
    }

    /// True when a read could still add bytes to the buffer.
    pub fn has_room(&self) -> bool {
        self.buffered().is_some_and(|buf| buf.len() < self.capacity)
    }

    /// Lends the payload of a completed read to the peer and marks this side
    /// ready to read again once the buffer comes back.
    pub fn lend_filled(&mut self) -> BytesMut {
        assert_eq!(self.read_state, IoState::Done, "{} has no completed read", self.role);
        let buf = match std::mem::replace(&mut self.slot, Slot::Lent) {
            Slot::Filled(buf) => buf,
            other => panic!("{} buffer is {:?}, expected filled", self.role, other),
        };
        self.read_state = IoState::Stop;
        buf
    }

    /// Receives the buffer back from the peer once it has been written out.
    pub fn restore(&mut self, mut buf: BytesMut) {
        if !matches!(self.slot, Slot::Lent) {
            panic!("{} buffer returned while {:?}", self.role, self.slot);
        }
        buf.clear();
        self.slot = Slot::Idle(buf);
    }

    /// True while this side's buffer is out on loan to the peer.
    pub fn is_lent(&self) -> bool {
        matches!(self.slot, Slot::Lent)
    }

    /// Writes `buf` out. The buffer belongs to the peer and comes back with
    /// the write completion.
    pub fn write(&mut self, buf: BytesMut, effects: &mut Vec<Effect>) {
        assert!(
            matches!(self.write_state, IoState::Stop | IoState::Done),
            "{} write issued while {:?}",
            self.role,
            self.write_state
        );
        self.write_state = IoState::Busy;
        effects.push(Effect::Write { role: self.role, buf });
        self.arm_timer(effects);
    }

    pub fn complete_write(&mut self, status: Status) {
        assert_eq!(self.write_state, IoState::Busy, "{} write completed while not busy", self.role);
        self.write_state = IoState::Done;
        self.last_result = status;
    }

    /// Marks a finished write as consumed.
    pub fn settle_write(&mut self) {
        if self.write_state == IoState::Done {
            self.write_state = IoState::Stop;
        }
    }

    /// The idle timer fired: record a synthetic timeout as the last result.
    pub fn expire(&mut self) {
        self.last_result = Status::Timeout;
    }

    /// Starts closing both handles. Outstanding operations are cancelled by
    /// the reactor and still report back.
    pub fn request_close(&mut self, effects: &mut Vec<Effect>) -> usize {
        assert_ne!(self.read_state, IoState::Dead, "{} closed twice", self.role);
        assert_ne!(self.write_state, IoState::Dead, "{} closed twice", self.role);
        self.read_state = IoState::Dead;
        self.write_state = IoState::Dead;
        effects.push(Effect::Close { role: self.role });
        self.open_handles as usize
    }

    /// One handle finished closing.
    pub fn closed(&mut self, handle: Handle) {
        assert!(self.is_dead(), "{} {:?} closed before close was requested", self.role, handle);
        assert!(self.open_handles > 0, "{} {:?} closed twice", self.role, handle);
        self.open_handles -= 1;
    }

    /// (Re)starts the idle timer.
    pub fn arm_timer(&self, effects: &mut Vec<Effect>) {
        effects.push(Effect::ArmTimer {
            role: self.role,
            after: self.idle_timeout,
        });
    }
}
