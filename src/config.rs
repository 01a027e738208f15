use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Serial link to the flight controller
    #[serde(default)]
    pub serial: SerialConfig,

    /// MAVLink-over-TCP server for Mission-Planner-style clients
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Tunnel proxy fronting a remote MAVLink port
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// WebSocket gateway for browser clients
    #[serde(default)]
    pub ws: WsConfig,

    /// Telemetry store-and-forward
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Performance stats logging interval in seconds (0 = disabled)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    /// Path to the serial device (e.g., /dev/ttyACM0)
    #[serde(default = "default_serial_device")]
    pub device: String,

    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Capacity of the outbound command queue
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_serial_device(),
            baud_rate: default_baud_rate(),
            command_queue: default_command_queue(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpConfig {
    /// Bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Port to listen on for incoming GCS connections
    #[serde(default = "default_tcp_port")]
    pub listen_port: u16,

    /// Connections beyond this are refused immediately
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Per-session outbound frame queue capacity
    #[serde(default = "default_session_queue")]
    pub session_queue: usize,

    /// Total drops after which a session is considered dead weight
    #[serde(default = "default_drop_threshold")]
    pub drop_threshold: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            listen_port: default_tcp_port(),
            max_clients: default_max_clients(),
            session_queue: default_session_queue(),
            drop_threshold: default_drop_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Run the tunnel proxy alongside the bridge
    #[serde(default)]
    pub enabled: bool,

    /// Bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Local port exposed to Mission Planner
    #[serde(default = "default_proxy_port")]
    pub listen_port: u16,

    /// Remote tunnel endpoint
    #[serde(default = "default_localhost")]
    pub upstream_host: String,

    #[serde(default = "default_tcp_port")]
    pub upstream_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_bind_addr(),
            listen_port: default_proxy_port(),
            upstream_host: default_localhost(),
            upstream_port: default_tcp_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WsConfig {
    /// Bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// WebSocket listen port
    #[serde(default = "default_ws_port")]
    pub listen_port: u16,

    /// Per-session outbound envelope queue capacity
    #[serde(default = "default_ws_queue")]
    pub session_queue: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            listen_port: default_ws_port(),
            session_queue: default_ws_queue(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Sync telemetry to the central server
    #[serde(default)]
    pub enabled: bool,

    /// Central server base URL
    #[serde(default)]
    pub base_url: String,

    /// Bearer token for the ingestion endpoint
    #[serde(default)]
    pub api_key: String,

    /// Vehicle identity reported with every record
    #[serde(default = "default_drone_id")]
    pub drone_id: String,

    /// Central realtime WebSocket URL (omit to disable the side channel)
    pub realtime_url: Option<String>,

    /// Buffer snapshot path
    #[serde(default = "default_buffer_file")]
    pub buffer_file: String,

    #[serde(default = "default_max_memory_records")]
    pub max_memory_records: usize,

    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Snapshot the buffer to disk every N ingested records
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// Capacity of the hub-to-store projection queue
    #[serde(default = "default_telemetry_queue")]
    pub queue: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            api_key: String::new(),
            drone_id: default_drone_id(),
            realtime_url: None,
            buffer_file: default_buffer_file(),
            max_memory_records: default_max_memory_records(),
            sync_interval_secs: default_sync_interval(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            checkpoint_interval: default_checkpoint_interval(),
            queue: default_telemetry_queue(),
        }
    }
}

fn default_serial_device() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud_rate() -> u32 {
    921_600
}

fn default_command_queue() -> usize {
    128
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_localhost() -> String {
    "127.0.0.1".to_string()
}

fn default_tcp_port() -> u16 {
    14550
}

fn default_proxy_port() -> u16 {
    14551
}

fn default_ws_port() -> u16 {
    8765
}

fn default_max_clients() -> usize {
    16
}

fn default_session_queue() -> usize {
    512
}

fn default_ws_queue() -> usize {
    256
}

fn default_drop_threshold() -> u64 {
    10_000
}

fn default_drone_id() -> String {
    "drone-001".to_string()
}

fn default_buffer_file() -> String {
    "/tmp/telemetry_buffer.json".to_string()
}

fn default_max_memory_records() -> usize {
    1000
}

fn default_sync_interval() -> u64 {
    5
}

fn default_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_checkpoint_interval() -> u64 {
    100
}

fn default_telemetry_queue() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    30
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn example() -> Self {
        Self {
            serial: SerialConfig::default(),
            tcp: TcpConfig::default(),
            proxy: ProxyConfig::default(),
            ws: WsConfig::default(),
            telemetry: TelemetryConfig::default(),
            log_level: default_log_level(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.serial.device, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, 921_600);
        assert_eq!(config.tcp.listen_port, 14550);
        assert_eq!(config.tcp.max_clients, 16);
        assert_eq!(config.proxy.listen_port, 14551);
        assert!(!config.proxy.enabled);
        assert_eq!(config.ws.listen_port, 8765);
        assert_eq!(config.telemetry.buffer_file, "/tmp/telemetry_buffer.json");
        assert_eq!(config.telemetry.batch_size, 50);
        assert_eq!(config.telemetry.max_retries, 3);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn partial_overrides_apply() {
        let config: Config = toml::from_str(
            r#"
            log_level = "debug"

            [serial]
            device = "/dev/ttyUSB0"
            baud_rate = 57600

            [telemetry]
            enabled = true
            base_url = "https://central.example.com"
            api_key = "secret"
            drone_id = "falcon-7"
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.device, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 57600);
        assert!(config.telemetry.enabled);
        assert_eq!(config.telemetry.drone_id, "falcon-7");
        // Untouched sections keep their defaults.
        assert_eq!(config.tcp.listen_port, 14550);
    }
}
