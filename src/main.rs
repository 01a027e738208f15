use mav_bridge::config::Config;
use mav_bridge::hub::Hub;
use mav_bridge::link::AutopilotLink;
use mav_bridge::metrics::Metrics;
use mav_bridge::proxy::TunnelProxy;
use mav_bridge::tcp::TcpServer;
use mav_bridge::telemetry::{self, SyncClient, TelemetryBuffer};
use mav_bridge::ws::WsGateway;
use mav_bridge::{init_tracing, shutdown};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first (before logging, so we can use config log level)
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)?,
        None => Config::example(),
    };

    init_tracing(&config.log_level);

    info!("mav-bridge starting...");

    if let Some(path) = std::env::args().nth(1) {
        info!("Loading config from {}", path);
    } else {
        info!("No config file specified, using default configuration");
        info!("Usage: mav-bridge [config.toml]");
    }

    info!("Configuration loaded:");
    info!("  Log level: {}", config.log_level);
    info!("  Serial: {} @ {}", config.serial.device, config.serial.baud_rate);
    info!("  TCP: {}:{} (max {} clients)", config.tcp.bind_addr, config.tcp.listen_port, config.tcp.max_clients);
    info!("  WebSocket: {}:{}", config.ws.bind_addr, config.ws.listen_port);
    info!(
        "  Tunnel proxy: {}",
        if config.proxy.enabled {
            format!(
                "port {} -> {}:{}",
                config.proxy.listen_port, config.proxy.upstream_host, config.proxy.upstream_port
            )
        } else {
            "disabled".to_string()
        }
    );
    info!(
        "  Telemetry sync: {}",
        if config.telemetry.enabled {
            config.telemetry.base_url.as_str()
        } else {
            "disabled"
        }
    );
    info!("  Stats interval: {}s", config.stats_interval_secs);

    let metrics = Metrics::new();
    if config.stats_interval_secs > 0 {
        metrics.clone().start_stats_logger(config.stats_interval_secs);
    } else {
        info!("Performance monitoring disabled (stats_interval_secs = 0)");
    }

    let (trigger, shutdown_rx) = shutdown::channel();

    // The hub owns VehicleState and the session set; everything else gets a
    // handle. No singletons, no shared mutable globals.
    let (hub, hub_handle, telemetry_deltas) = Hub::new(metrics.clone(), config.telemetry.queue);
    tokio::spawn(hub.run());

    let (link, commands) = AutopilotLink::new(
        config.serial.device.clone(),
        config.serial.baud_rate,
        hub_handle.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
        config.serial.command_queue,
    );
    let link_task = tokio::spawn(link.run());

    // Telemetry store-and-forward.
    let buffer = Arc::new(TelemetryBuffer::new(
        config.telemetry.buffer_file.clone(),
        config.telemetry.max_memory_records,
        config.telemetry.max_retries,
        config.telemetry.checkpoint_interval,
    ));
    buffer.load();

    let realtime_tx = match (&config.telemetry.realtime_url, config.telemetry.enabled) {
        (Some(url), true) => {
            let (tx, rx) = mpsc::channel(config.telemetry.queue);
            tokio::spawn(telemetry::realtime::run_realtime_client(
                url.clone(),
                rx,
                shutdown_rx.clone(),
            ));
            Some(tx)
        }
        _ => None,
    };

    tokio::spawn(telemetry::run_intake(
        telemetry_deltas,
        Arc::clone(&buffer),
        config.telemetry.drone_id.clone(),
        realtime_tx,
        shutdown_rx.clone(),
    ));

    if config.telemetry.enabled {
        let client = SyncClient::new(
            &config.telemetry.base_url,
            &config.telemetry.api_key,
            &config.telemetry.drone_id,
        )?;
        tokio::spawn(telemetry::sync::run_sync_loop(
            Arc::clone(&buffer),
            client,
            Duration::from_secs(config.telemetry.sync_interval_secs.max(1)),
            config.telemetry.batch_size,
            shutdown_rx.clone(),
        ));
    }

    // Remote operator surfaces.
    let tcp_server = TcpServer::bind(
        config.tcp.clone(),
        hub_handle.clone(),
        commands.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
    )
    .await?;
    tokio::spawn(tcp_server.run());

    let gateway = WsGateway::bind(
        &config.ws.bind_addr,
        config.ws.listen_port,
        hub_handle.clone(),
        commands.clone(),
        Some(Arc::clone(&buffer)),
        metrics.clone(),
        shutdown_rx.clone(),
        config.ws.session_queue,
    )
    .await?;
    tokio::spawn(gateway.run());

    if config.proxy.enabled {
        let proxy = TunnelProxy::bind(
            &config.proxy.bind_addr,
            config.proxy.listen_port,
            config.proxy.upstream_host.clone(),
            config.proxy.upstream_port,
            shutdown_rx.clone(),
        )
        .await?;
        tokio::spawn(proxy.run());
    }

    info!("mav-bridge ready");

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    // Shutdown order: accept loops stop first, session writers drain (up to
    // 2 s each), the link closes, then the buffer flushes to disk.
    trigger.trigger();
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    if let Err(e) = tokio::time::timeout(Duration::from_secs(2), link_task).await {
        warn!("Autopilot link did not close in time: {}", e);
    }

    if let Err(e) = buffer.save() {
        error!("Failed to flush telemetry buffer: {}", e);
    } else {
        info!("Telemetry buffer flushed");
    }

    info!("mav-bridge stopped");
    Ok(())
}
