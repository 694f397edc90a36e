use conduit::config::Config;
use conduit::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;
    let level: tracing::Level = cfg.log_level.parse()?;

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(level)
        .init();

    tracing::info!(
        listen = %cfg.listen_addr(),
        idle_timeout_ms = cfg.server.idle_timeout_ms,
        buffer_size = cfg.server.buffer_size,
        "Starting conduit"
    );

    tokio::select! {
        res = server::listener::run(&cfg) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
