use clap::Parser;
use mav_bridge::proxy::TunnelProxy;
use mav_bridge::{init_tracing, shutdown};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info};

/// TCP relay exposing a tunneled remote MAVLink port to local clients.
#[derive(Parser, Debug)]
#[command(name = "tunnel-proxy")]
struct Args {
    /// Local port Mission Planner connects to
    #[arg(long, default_value_t = 14551)]
    listen_port: u16,

    /// Remote tunnel endpoint host
    #[arg(long)]
    upstream_host: String,

    /// Remote tunnel endpoint port
    #[arg(long)]
    upstream_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let (trigger, shutdown_rx) = shutdown::channel();

    let proxy = match TunnelProxy::bind(
        "0.0.0.0",
        args.listen_port,
        args.upstream_host.clone(),
        args.upstream_port,
        shutdown_rx,
    )
    .await
    {
        Ok(proxy) => proxy,
        Err(e) => {
            error!("Fatal: failed to start tunnel proxy: {}", e);
            std::process::exit(1);
        }
    };

    let stats = proxy.stats();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!("=== Tunnel Proxy Stats ===");
            info!(
                "  Connections: {} total, {} active, {} clean closes",
                stats.connections_total.load(Ordering::Relaxed),
                stats.connections_active.load(Ordering::Relaxed),
                stats.clean_closes.load(Ordering::Relaxed),
            );
            info!(
                "  Bytes: {} client->upstream, {} upstream->client",
                stats.bytes_client_to_upstream.load(Ordering::Relaxed),
                stats.bytes_upstream_to_client.load(Ordering::Relaxed),
            );
            info!("  Errors: {}", stats.errors.load(Ordering::Relaxed));
        }
    });

    let proxy_task = tokio::spawn(proxy.run());

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Interrupt received, stopping tunnel proxy");
        trigger.trigger();
        let _ = proxy_task.await;
        std::process::exit(130);
    }
}
