//! Upstream selection and connection establishment
//!
//! The routing target comes from the parsed request head: the request
//! target itself when it names an authority, otherwise the `Host` header.

use crate::http::request::{RequestHead, TargetForm};
use std::fmt;
use std::future::Future;
use std::io;
use tokio::net::{lookup_host, TcpStream};
use url::{Host, Url};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("origin-form request without a Host header")]
    NoHost,
    #[error("invalid upstream target {0:?}")]
    Invalid(String),
}

/// Upstream endpoint a session connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host name or literal address, without IPv6 brackets.
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Target {
    /// Picks the upstream for a request.
    ///
    /// Absolute-form targets use their URL authority (falling back to the
    /// scheme's well-known port, then `default_port`). Authority-form
    /// targets are used as is. Origin-form targets route on `Host`.
    pub fn from_head(head: &RequestHead, default_port: u16) -> Result<Self, RouteError> {
        match head.target_form() {
            TargetForm::Absolute => Self::from_url(&head.target, default_port),
            TargetForm::Authority => Self::from_authority(&head.target, default_port),
            TargetForm::Origin => {
                let host = head.header("Host").ok_or(RouteError::NoHost)?;
                Self::from_authority(host, default_port)
            }
        }
    }

    pub fn from_url(raw: &str, default_port: u16) -> Result<Self, RouteError> {
        let url = Url::parse(raw).map_err(|_| RouteError::Invalid(raw.to_string()))?;
        let host = host_string(url.host()).ok_or_else(|| RouteError::Invalid(raw.to_string()))?;
        let port = url.port_or_known_default().unwrap_or(default_port);
        Ok(Self { host, port })
    }

    /// Parses `host[:port]`, with IPv6 literals in brackets.
    pub fn from_authority(raw: &str, default_port: u16) -> Result<Self, RouteError> {
        let invalid = || RouteError::Invalid(raw.to_string());
        let raw = raw.trim();
        if raw.is_empty() || raw.contains(['/', '?', '#', '@']) {
            return Err(invalid());
        }

        // A scheme without special rules keeps the host verbatim and
        // leaves the port alone.
        let url = Url::parse(&format!("tcp://{raw}")).map_err(|_| invalid())?;
        let host = host_string(url.host()).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            host,
            port: url.port().unwrap_or(default_port),
        })
    }
}

fn host_string(host: Option<Host<&str>>) -> Option<String> {
    match host? {
        Host::Domain(domain) => Some(domain.to_string()),
        Host::Ipv4(addr) => Some(addr.to_string()),
        Host::Ipv6(addr) => Some(addr.to_string()),
    }
}

/// Establishes upstream connections for sessions.
///
/// The reactor treats the returned future as one opaque operation: it
/// either yields a connected stream or fails, and failure takes the same
/// path as any other I/O error.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, target: &Target) -> impl Future<Output = io::Result<TcpStream>> + Send;
}

/// Connects over TCP using the system resolver.
///
/// Literal addresses skip resolution. Resolved addresses are tried in the
/// order the resolver returns them, without preferring a family; the first
/// successful connect wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, target: &Target) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let target = target.clone();
        async move {
            let mut last_error = None;
            for addr in lookup_host((target.host.as_str(), target.port)).await? {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        tracing::trace!(upstream = %target, %addr, "Connected to upstream");
                        return Ok(stream);
                    }
                    Err(e) => {
                        tracing::debug!(upstream = %target, %addr, error = %e, "Upstream address refused");
                        last_error = Some(e);
                    }
                }
            }

            Err(last_error.unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{target} resolved to no addresses"),
                )
            }))
        }
    }
}
