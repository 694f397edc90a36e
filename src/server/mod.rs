//! Socket-facing side of the relay.
//!
//! - **`listener`**: binds the configured addresses and accepts clients
//! - **`reactor`**: runs one session over its sockets and timers

pub mod listener;
pub mod reactor;
