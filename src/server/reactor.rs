//! Drives one [`Session`] over real sockets.
//!
//! The reactor owns the client socket, the upstream socket (once
//! connected) and one idle timer per leg. It turns each [`Effect`] into a
//! pending operation and waits for the first one to finish, feeding the
//! resulting [`Event`] back into the session. Operations are kept as
//! boxed futures that hand their socket half and buffer back on
//! completion, so a leg never has two reads or two writes in flight.

use bytes::BytesMut;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant, Sleep};
use tracing::debug;

use crate::proxy::connection::{Handle, Role, Status};
use crate::proxy::session::{Effect, Event, Failure, Session};
use crate::proxy::upstream::{Connector, Target};

type Op<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// What a finished session leaves behind.
#[derive(Debug, Clone)]
pub struct Summary {
    pub id: u64,
    pub target: Option<Target>,
    pub failure: Option<Failure>,
    pub bytes_to_client: u64,
    pub bytes_to_upstream: u64,
}

#[derive(Default)]
struct Leg {
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    read_op: Option<Op<(OwnedReadHalf, BytesMut, Status)>>,
    write_op: Option<Op<(OwnedWriteHalf, BytesMut, Status)>>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl Leg {
    fn with_stream(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Some(reader),
            writer: Some(writer),
            ..Self::default()
        }
    }

    fn arm(&mut self, after: std::time::Duration) {
        if let Some(timer) = self.timer.as_mut() {
            timer.as_mut().reset(Instant::now() + after);
        } else {
            self.timer = Some(Box::pin(sleep(after)));
        }
    }
}

pub struct Reactor<C> {
    session: Session,
    client: Leg,
    upstream: Leg,
    connect_op: Option<Op<io::Result<TcpStream>>>,
    connector: Arc<C>,
    /// Completions produced synchronously by closing a leg.
    queue: VecDeque<Event>,
}

impl<C: Connector> Reactor<C> {
    pub fn new(session: Session, socket: TcpStream, connector: Arc<C>) -> Self {
        Self {
            session,
            client: Leg::with_stream(socket),
            upstream: Leg::default(),
            connect_op: None,
            connector,
            queue: VecDeque::new(),
        }
    }

    /// Runs the session until it is released.
    pub async fn run(mut self) -> Summary {
        let effects = self.session.start();
        let mut released = self.apply(effects);

        while !released {
            let event = match self.queue.pop_front() {
                Some(event) => event,
                None => self.next_event().await,
            };
            let effects = self.session.handle(event);
            released = self.apply(effects);
        }

        debug_assert!(self.queue.is_empty(), "events left after release");
        Summary {
            id: self.session.id(),
            target: self.session.target().cloned(),
            failure: self.session.failure().cloned(),
            bytes_to_client: self.session.bytes_written(Role::Client),
            bytes_to_upstream: self.session.bytes_written(Role::Upstream),
        }
    }

    /// Starts every requested operation. Returns true on release.
    fn apply(&mut self, effects: Vec<Effect>) -> bool {
        let mut released = false;
        for effect in effects {
            match effect {
                Effect::Read { role, buf } => {
                    let leg = self.leg(role);
                    let Some(reader) = leg.reader.take() else {
                        panic!("{role} read issued without a readable socket");
                    };
                    leg.read_op = Some(Box::pin(read_into(reader, buf)));
                }
                Effect::Write { role, buf } => {
                    let leg = self.leg(role);
                    let Some(writer) = leg.writer.take() else {
                        panic!("{role} write issued without a writable socket");
                    };
                    leg.write_op = Some(Box::pin(write_from(writer, buf)));
                }
                Effect::ArmTimer { role, after } => self.leg(role).arm(after),
                Effect::Connect { target } => {
                    let connector = Arc::clone(&self.connector);
                    self.connect_op = Some(Box::pin(async move { connector.connect(&target).await }));
                }
                Effect::Close { role } => self.close(role),
                Effect::Release => released = true,
            }
        }
        released
    }

    async fn next_event(&mut self) -> Event {
        tokio::select! {
            (reader, buf, status) = complete(&mut self.client.read_op) => {
                self.client.reader = Some(reader);
                Event::Read { role: Role::Client, buf, status }
            }
            (writer, buf, status) = complete(&mut self.client.write_op) => {
                self.client.writer = Some(writer);
                Event::Write { role: Role::Client, buf, status }
            }
            (reader, buf, status) = complete(&mut self.upstream.read_op) => {
                self.upstream.reader = Some(reader);
                Event::Read { role: Role::Upstream, buf, status }
            }
            (writer, buf, status) = complete(&mut self.upstream.write_op) => {
                self.upstream.writer = Some(writer);
                Event::Write { role: Role::Upstream, buf, status }
            }
            result = complete(&mut self.connect_op) => match result {
                Ok(stream) => {
                    self.upstream = Leg {
                        timer: self.upstream.timer.take(),
                        ..Leg::with_stream(stream)
                    };
                    Event::Connected
                }
                Err(e) => {
                    debug!(error = %e, "Upstream connect failed");
                    Event::ConnectFailed(Status::from(&e))
                }
            },
            () = expire(&mut self.client.timer) => Event::Timeout { role: Role::Client },
            () = expire(&mut self.upstream.timer) => Event::Timeout { role: Role::Upstream },
        }
    }

    /// Drops the socket and timer of `role`. In-flight operations are
    /// cancelled and still reported, followed by one closure per handle.
    fn close(&mut self, role: Role) {
        let leg = match role {
            Role::Client => &mut self.client,
            Role::Upstream => &mut self.upstream,
        };

        if leg.read_op.take().is_some() {
            self.queue.push_back(Event::Read {
                role,
                buf: BytesMut::new(),
                status: Status::Cancelled,
            });
        }
        if leg.write_op.take().is_some() {
            self.queue.push_back(Event::Write {
                role,
                buf: BytesMut::new(),
                status: Status::Cancelled,
            });
        }
        if role == Role::Upstream && self.connect_op.take().is_some() {
            self.queue.push_back(Event::ConnectFailed(Status::Cancelled));
        }

        leg.reader = None;
        leg.writer = None;
        self.queue.push_back(Event::Closed {
            role,
            handle: Handle::Socket,
        });
        leg.timer = None;
        self.queue.push_back(Event::Closed {
            role,
            handle: Handle::Timer,
        });
    }

    fn leg(&mut self, role: Role) -> &mut Leg {
        match role {
            Role::Client => &mut self.client,
            Role::Upstream => &mut self.upstream,
        }
    }
}

async fn read_into(mut reader: OwnedReadHalf, mut buf: BytesMut) -> (OwnedReadHalf, BytesMut, Status) {
    let start = buf.len();
    buf.resize(buf.capacity(), 0);
    let status = match reader.read(&mut buf[start..]).await {
        Ok(0) => Status::Eof,
        Ok(n) => Status::Ok(n),
        Err(e) => Status::from(&e),
    };
    let filled = match status {
        Status::Ok(n) => n,
        _ => 0,
    };
    buf.truncate(start + filled);
    (reader, buf, status)
}

async fn write_from(mut writer: OwnedWriteHalf, buf: BytesMut) -> (OwnedWriteHalf, BytesMut, Status) {
    let status = match writer.write_all(&buf).await {
        Ok(()) => Status::Ok(buf.len()),
        Err(e) => Status::from(&e),
    };
    (writer, buf, status)
}

/// Waits for the operation in `op`, if any, and clears the slot.
async fn complete<T>(op: &mut Option<Op<T>>) -> T {
    match op {
        Some(fut) => {
            let out = fut.await;
            *op = None;
            out
        }
        None => std::future::pending().await,
    }
}

/// Fires once per arming; a disarmed timer never fires.
async fn expire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => {
            sleep.as_mut().await;
            *timer = None;
        }
        None => std::future::pending().await,
    }
}
