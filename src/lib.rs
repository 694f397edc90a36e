//! Conduit - transparent TCP relay
//!
//! Accepts client connections, reads just enough of the request head to
//! pick an upstream, then relays bytes both ways until either side closes
//! or goes idle.

pub mod config;
pub mod http;
pub mod proxy;
pub mod server;
