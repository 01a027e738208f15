use clap::Parser;
use mav_bridge::hub::Hub;
use mav_bridge::metrics::Metrics;
use mav_bridge::uplink::TcpUplink;
use mav_bridge::ws::WsGateway;
use mav_bridge::{init_tracing, shutdown};
use tracing::{error, info};

/// Bridge an upstream TCP MAVLink endpoint to browser clients over
/// WebSocket JSON envelopes.
#[derive(Parser, Debug)]
#[command(name = "ws-bridge")]
struct Args {
    /// WebSocket listen port
    #[arg(long, default_value_t = 8765)]
    ws_port: u16,

    /// Upstream TCP MAVLink host (e.g. a tunnel endpoint)
    #[arg(long)]
    upstream_host: String,

    /// Upstream TCP MAVLink port
    #[arg(long)]
    upstream_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

const COMMAND_QUEUE: usize = 128;
const SESSION_QUEUE: usize = 256;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level);

    info!("ws-bridge starting...");
    info!("  WebSocket port: {}", args.ws_port);
    info!("  Upstream: {}:{}", args.upstream_host, args.upstream_port);

    let metrics = Metrics::new();
    let (trigger, shutdown_rx) = shutdown::channel();

    let (hub, hub_handle, _deltas) = Hub::new(metrics.clone(), 16);
    tokio::spawn(hub.run());

    let (uplink, commands) = TcpUplink::new(
        args.upstream_host.clone(),
        args.upstream_port,
        hub_handle.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
        COMMAND_QUEUE,
    );
    tokio::spawn(uplink.run());

    let gateway = match WsGateway::bind(
        "0.0.0.0",
        args.ws_port,
        hub_handle,
        commands,
        None,
        metrics.clone(),
        shutdown_rx,
        SESSION_QUEUE,
    )
    .await
    {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Fatal: failed to start WebSocket gateway: {}", e);
            std::process::exit(1);
        }
    };
    let gateway_task = tokio::spawn(gateway.run());

    metrics.start_stats_logger(30);
    info!("ws-bridge ready");

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Interrupt received, stopping ws-bridge");
        trigger.trigger();
        let _ = gateway_task.await;
        std::process::exit(130);
    }
}
