use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{lookup_host, TcpListener};
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument};

use crate::config::Config;
use crate::proxy::session::{Session, SessionSettings};
use crate::proxy::upstream::{Connector, TcpConnector};
use crate::server::reactor::Reactor;

/// Binds every address `bind_host` resolves to and serves them all until
/// one of the accept loops fails.
pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let host = cfg.server.bind_host.as_str();
    let port = cfg.server.bind_port;

    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}"))?
        .collect();
    if addrs.is_empty() {
        anyhow::bail!("{host} has no IPv4/6 addresses");
    }

    let mut listeners = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("Listening on {}", addr);
        listeners.push(listener);
    }

    let settings = Arc::new(SessionSettings::from(cfg));
    let connector = Arc::new(TcpConnector);
    let mut servers = JoinSet::new();
    for listener in listeners {
        servers.spawn(serve(listener, Arc::clone(&settings), Arc::clone(&connector)));
    }

    while let Some(joined) = servers.join_next().await {
        joined.context("accept loop panicked")??;
    }
    Ok(())
}

/// Accept loop for one bound socket: every client gets its own session,
/// driven by its own reactor task.
pub async fn serve<C: Connector>(
    listener: TcpListener,
    settings: Arc<SessionSettings>,
    connector: Arc<C>,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "TCP accept error");
                continue;
            }
        };
        if let Err(e) = socket.set_nodelay(true) {
            warn!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let session = Session::new(&settings);
        let span = tracing::info_span!("session", id = session.id(), %peer);
        span.in_scope(|| info!("Accepted connection from {}", peer));

        let reactor = Reactor::new(session, socket, Arc::clone(&connector));
        tokio::spawn(async move { reactor.run().await }.instrument(span));
    }
}
