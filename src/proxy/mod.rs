//! Relay core
//!
//! This module holds the I/O-free state machines that make up a session
//! and the upstream connection capability the reactor calls into.
//!
//! - **`connection`**: per-leg read/write progress, idle timer and buffer
//! - **`relay`**: the back-pressured pump between two established legs
//! - **`session`**: request parsing, upstream connect, relay and teardown
//! - **`upstream`**: routing target selection and the `Connector` trait

pub mod connection;
pub mod relay;
pub mod session;
pub mod upstream;

pub use connection::{Connection, IoState, Role, Status};
pub use session::{Effect, Event, Failure, Session, SessionSettings, State};
pub use upstream::{Connector, Target, TcpConnector};
