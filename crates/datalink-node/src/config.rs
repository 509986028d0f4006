//! Node configuration.
//!
//! Configuration can be loaded from:
//! - `--config <path>` on the command line, or `DATALINK_CONFIG`
//! - `datalink.toml`, `/etc/datalink/datalink.toml`, `~/.config/datalink/datalink.toml`
//! - Environment variables (DATALINK_*) applied on top

use anyhow::{Context, Result};
use datalink_core::{LinkId, RouterConfig, TopicId, DEFAULT_EXCLUSION_CAPACITY};
use datalink_protocol::DEFAULT_HOPS;
use datalink_transport::GatewayConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Link id of the serial gateway.
pub const SERIAL_LINK: LinkId = LinkId(1);

/// Link id of the wireless gateway.
pub const WIRELESS_LINK: LinkId = LinkId(2);

/// Node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity.
    #[serde(default)]
    pub node: NodeConfig,

    /// Bridge task.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Local estimation process channels.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Topic id assignment.
    #[serde(default)]
    pub topics: TopicMap,

    /// Cross-link routing.
    #[serde(default)]
    pub router: RouterSection,

    /// Serial gateway to the flight computer.
    #[serde(default)]
    pub serial: SerialConfig,

    /// Wireless gateway to the peer node.
    #[serde(default)]
    pub wireless: WirelessConfig,

    /// Estimation process launcher.
    #[serde(default)]
    pub launcher: LauncherConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Node identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Numeric node id, carried in heartbeats.
    #[serde(default = "default_node_id")]
    pub id: u32,

    /// Name used in logs.
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Heartbeat period in milliseconds. 0 disables the heartbeat.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
}

/// Bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Tick period in milliseconds.
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
}

/// Local process channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Address both ends bind on.
    #[serde(default = "default_ipc_host")]
    pub host: IpAddr,

    /// Channel n is bound at `bridge_base_port + n`.
    #[serde(default = "default_bridge_base_port")]
    pub bridge_base_port: u16,

    /// Channel n of the estimation process listens at `process_base_port + n`.
    #[serde(default = "default_process_base_port")]
    pub process_base_port: u16,

    /// Telemetry channel number.
    #[serde(default = "default_telemetry_channel")]
    pub telemetry_channel: u16,

    /// Command channel number.
    #[serde(default = "default_command_channel")]
    pub command_channel: u16,

    /// State channel number.
    #[serde(default = "default_state_channel")]
    pub state_channel: u16,
}

/// Topic id assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicMap {
    pub self_telemetry: TopicId,
    pub self_command: TopicId,
    pub self_state: TopicId,
    pub target_telemetry: TopicId,
    pub target_command: TopicId,
    pub target_state: TopicId,
    pub internode_telemetry: TopicId,
    pub internode_command: TopicId,
    pub internode_state: TopicId,
    pub wifi_access_point: TopicId,
    pub wifi_station: TopicId,
    pub heartbeat_local: TopicId,
    pub heartbeat_internode: TopicId,
}

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    /// Relay topic reports between links.
    #[serde(default = "default_true")]
    pub forward_topic_reports: bool,

    /// Topics never relayed from one link to another.
    #[serde(default = "default_router_exclude")]
    pub exclude: Vec<TopicId>,

    /// Exclusion set capacity.
    #[serde(default = "default_exclusion_capacity")]
    pub exclusion_capacity: usize,
}

/// Serial gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Enable the serial gateway.
    #[serde(default)]
    pub enabled: bool,

    /// Device path, configured beforehand with `stty`.
    #[serde(default = "default_serial_device")]
    pub device: String,

    /// Forward every registered topic.
    #[serde(default = "default_true")]
    pub forward_all: bool,

    /// Topics to forward when `forward_all` is off.
    #[serde(default)]
    pub topics: Vec<TopicId>,

    /// Topics kept off the serial link.
    #[serde(default = "default_internode_topics")]
    pub exclude: Vec<TopicId>,

    /// Outbound poll period in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Hop budget of created envelopes.
    #[serde(default = "default_hops")]
    pub default_hops: i32,

    /// Topic report period in milliseconds. 0 disables reports.
    #[serde(default)]
    pub report_interval_ms: u64,

    /// Relay queue capacity.
    #[serde(default = "default_relay_queue")]
    pub relay_queue: usize,
}

/// Wireless gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirelessConfig {
    /// Enable the wireless gateway.
    #[serde(default)]
    pub enabled: bool,

    /// Local UDP address.
    #[serde(default = "default_wireless_bind")]
    pub bind: String,

    /// Peer node UDP address.
    #[serde(default = "default_wireless_peer")]
    pub peer: String,

    /// Drop datagrams from anyone but the peer.
    #[serde(default = "default_true")]
    pub peer_only: bool,

    /// Forward every registered topic.
    #[serde(default)]
    pub forward_all: bool,

    /// Topics to forward when `forward_all` is off.
    #[serde(default = "default_internode_topics")]
    pub topics: Vec<TopicId>,

    /// Topics kept off the wireless link.
    #[serde(default = "default_local_topics")]
    pub exclude: Vec<TopicId>,

    /// Topics the peer may add through topic reports.
    #[serde(default)]
    pub learnable: Vec<TopicId>,

    /// Outbound poll period in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Hop budget of created envelopes.
    #[serde(default = "default_hops")]
    pub default_hops: i32,

    /// Topic report period in milliseconds. 0 disables reports.
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,

    /// Relay queue capacity.
    #[serde(default = "default_relay_queue")]
    pub relay_queue: usize,
}

/// Launcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Launch the estimation process on a startup command.
    #[serde(default)]
    pub enabled: bool,

    /// Program to run.
    #[serde(default = "default_program")]
    pub program: String,

    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, `~` is expanded.
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often link and router counters are exported, in milliseconds.
    #[serde(default = "default_metrics_interval")]
    pub interval_ms: u64,
}

// Default value functions
fn default_node_id() -> u32 {
    1
}

fn default_node_name() -> String {
    "datalink".to_string()
}

fn default_heartbeat_interval() -> u64 {
    1_000
}

fn default_tick() -> u64 {
    10
}

fn default_ipc_host() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_bridge_base_port() -> u16 {
    40_000
}

fn default_process_base_port() -> u16 {
    41_000
}

fn default_telemetry_channel() -> u16 {
    10
}

fn default_command_channel() -> u16 {
    11
}

fn default_state_channel() -> u16 {
    12
}

fn default_true() -> bool {
    true
}

fn default_router_exclude() -> Vec<TopicId> {
    let mut topics = default_local_topics();
    topics.extend(default_internode_topics());
    topics
}

fn default_local_topics() -> Vec<TopicId> {
    let topics = TopicMap::default();
    vec![
        topics.self_telemetry,
        topics.self_command,
        topics.self_state,
        topics.target_telemetry,
        topics.target_command,
        topics.target_state,
        topics.wifi_access_point,
        topics.wifi_station,
        topics.heartbeat_local,
    ]
}

fn default_internode_topics() -> Vec<TopicId> {
    let topics = TopicMap::default();
    vec![
        topics.internode_telemetry,
        topics.internode_command,
        topics.internode_state,
        topics.heartbeat_internode,
    ]
}

fn default_exclusion_capacity() -> usize {
    DEFAULT_EXCLUSION_CAPACITY
}

fn default_serial_device() -> String {
    "/dev/ttyS4".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_hops() -> i32 {
    DEFAULT_HOPS
}

fn default_relay_queue() -> usize {
    256
}

fn default_wireless_bind() -> String {
    "0.0.0.0:50000".to_string()
}

fn default_wireless_peer() -> String {
    "192.168.4.2:50000".to_string()
}

fn default_report_interval() -> u64 {
    1_000
}

fn default_program() -> String {
    "estimator".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_interval() -> u64 {
    1_000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            name: default_node_name(),
            heartbeat_interval_ms: default_heartbeat_interval(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick(),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            host: default_ipc_host(),
            bridge_base_port: default_bridge_base_port(),
            process_base_port: default_process_base_port(),
            telemetry_channel: default_telemetry_channel(),
            command_channel: default_command_channel(),
            state_channel: default_state_channel(),
        }
    }
}

impl Default for TopicMap {
    fn default() -> Self {
        Self {
            self_telemetry: 1100,
            self_command: 1101,
            self_state: 1102,
            target_telemetry: 1200,
            target_command: 1201,
            target_state: 1202,
            internode_telemetry: 1400,
            internode_command: 1401,
            internode_state: 1402,
            wifi_access_point: 1500,
            wifi_station: 1501,
            heartbeat_local: 1600,
            heartbeat_internode: 1601,
        }
    }
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            forward_topic_reports: true,
            exclude: default_router_exclude(),
            exclusion_capacity: default_exclusion_capacity(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: default_serial_device(),
            forward_all: true,
            topics: Vec::new(),
            exclude: default_internode_topics(),
            poll_interval_ms: default_poll_interval(),
            default_hops: default_hops(),
            report_interval_ms: 0,
            relay_queue: default_relay_queue(),
        }
    }
}

impl Default for WirelessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_wireless_bind(),
            peer: default_wireless_peer(),
            peer_only: true,
            forward_all: false,
            topics: default_internode_topics(),
            exclude: default_local_topics(),
            learnable: Vec::new(),
            poll_interval_ms: default_poll_interval(),
            default_hops: default_hops(),
            report_interval_ms: default_report_interval(),
            relay_queue: default_relay_queue(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: default_program(),
            args: Vec::new(),
            working_dir: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            interval_ms: default_metrics_interval(),
        }
    }
}

fn report_interval(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl IpcConfig {
    /// Address the bridge binds for a channel.
    #[must_use]
    pub fn bridge_addr(&self, channel: u16) -> SocketAddr {
        SocketAddr::new(self.host, self.bridge_base_port.saturating_add(channel))
    }

    /// Address the estimation process listens on for a channel.
    #[must_use]
    pub fn process_addr(&self, channel: u16) -> SocketAddr {
        SocketAddr::new(self.host, self.process_base_port.saturating_add(channel))
    }
}

impl RouterSection {
    /// Router settings.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            forward_topic_reports: self.forward_topic_reports,
            exclusion_capacity: self.exclusion_capacity,
        }
    }
}

impl SerialConfig {
    /// Gateway settings for the serial link.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            forward_all: self.forward_all,
            topics: self.topics.clone(),
            exclude: self.exclude.clone(),
            default_hops: self.default_hops,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            report_interval: report_interval(self.report_interval_ms),
            relay_queue: self.relay_queue,
            ..GatewayConfig::new(SERIAL_LINK)
        }
    }

    /// Device path with `~` and variables expanded.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced variable is not set.
    pub fn device_path(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.device)
            .with_context(|| format!("Invalid serial device path: {}", self.device))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }
}

impl WirelessConfig {
    /// Gateway settings for the wireless link.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            forward_all: self.forward_all,
            topics: self.topics.clone(),
            exclude: self.exclude.clone(),
            learnable: self.learnable.clone(),
            default_hops: self.default_hops,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            report_interval: report_interval(self.report_interval_ms),
            relay_queue: self.relay_queue,
            ..GatewayConfig::new(WIRELESS_LINK)
        }
    }

    /// Parsed local address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not `host:port`.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("Invalid wireless bind address: {}", self.bind))
    }

    /// Parsed peer address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not `host:port`.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.peer
            .parse()
            .with_context(|| format!("Invalid wireless peer address: {}", self.peer))
    }
}

impl Config {
    /// Load configuration from a file or defaults, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match Self::locate(explicit) {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration");
                Self::from_file(&path)?
            }
            None => {
                debug!("No configuration file found, using defaults");
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(PathBuf::from(
                shellexpand::tilde(&path.to_string_lossy()).as_ref(),
            ));
        }

        let config_paths = [
            "datalink.toml",
            "/etc/datalink/datalink.toml",
            "~/.config/datalink/datalink.toml",
        ];

        config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply `DATALINK_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override does not parse.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(id) = lookup("DATALINK_NODE_ID") {
            self.node.id = id
                .parse()
                .with_context(|| format!("Invalid DATALINK_NODE_ID: {id}"))?;
        }
        if let Some(name) = lookup("DATALINK_NODE_NAME") {
            self.node.name = name;
        }
        if let Some(device) = lookup("DATALINK_SERIAL_DEVICE") {
            self.serial.device = device;
            self.serial.enabled = true;
        }
        if let Some(bind) = lookup("DATALINK_WIRELESS_BIND") {
            self.wireless.bind = bind;
        }
        if let Some(peer) = lookup("DATALINK_WIRELESS_PEER") {
            self.wireless.peer = peer;
            self.wireless.enabled = true;
        }
        if let Some(port) = lookup("DATALINK_METRICS_PORT") {
            self.metrics.port = port
                .parse()
                .with_context(|| format!("Invalid DATALINK_METRICS_PORT: {port}"))?;
            self.metrics.enabled = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bridge.tick_ms, 10);
        assert_eq!(config.topics.internode_command, 1401);
        assert_eq!(config.ipc.telemetry_channel, 10);
        assert_eq!(config.ipc.command_channel, 11);
        assert_eq!(config.router.exclusion_capacity, 1000);
        assert!(config.router.exclude.contains(&1401));
        assert!(!config.serial.enabled);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_default_router_exclusion_covers_every_node_topic() {
        let config = Config::default();
        let topics = &config.topics;
        for id in [
            topics.self_telemetry,
            topics.self_command,
            topics.self_state,
            topics.target_telemetry,
            topics.target_command,
            topics.target_state,
            topics.internode_telemetry,
            topics.internode_command,
            topics.internode_state,
            topics.wifi_access_point,
            topics.wifi_station,
            topics.heartbeat_local,
            topics.heartbeat_internode,
        ] {
            assert!(config.router.exclude.contains(&id), "topic {id} not excluded");
        }

        // Nothing local may leave on the wireless link
        let wireless = config.wireless.gateway_config();
        for id in [1100, 1101, 1102, 1200, 1201, 1202, 1500, 1501, 1600] {
            assert!(wireless.exclude.contains(&id), "topic {id} not kept off wireless");
            assert!(!wireless.topics.contains(&id));
        }
        assert!(wireless.learnable.is_empty());
    }

    #[test]
    fn test_ipc_addresses() {
        let config = IpcConfig::default();
        assert_eq!(config.bridge_addr(10), "127.0.0.1:40010".parse().unwrap());
        assert_eq!(config.process_addr(11), "127.0.0.1:41011".parse().unwrap());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [node]
            id = 2
            name = "node-b"

            [topics]
            internode_command = 2401

            [router]
            exclude = [2401]

            [serial]
            enabled = true
            device = "/dev/ttyUSB0"

            [wireless]
            peer = "10.0.0.1:50000"
            report_interval_ms = 0
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.id, 2);
        assert_eq!(config.topics.internode_command, 2401);
        assert_eq!(config.topics.self_command, 1101);
        assert_eq!(config.router.exclude, vec![2401]);
        assert!(config.router.forward_topic_reports);
        assert!(config.serial.enabled);
        assert!(config.serial.forward_all);
        assert_eq!(config.serial.default_hops, 10);
        assert_eq!(
            config.wireless.peer_addr().unwrap(),
            "10.0.0.1:50000".parse().unwrap()
        );
        assert!(config.wireless.gateway_config().report_interval.is_none());
    }

    #[test]
    fn test_gateway_configs() {
        let config = Config::default();

        let serial = config.serial.gateway_config();
        assert_eq!(serial.link_id, SERIAL_LINK);
        assert!(serial.forward_all);
        assert!(serial.exclude.contains(&1401));
        assert_eq!(serial.poll_interval, Duration::from_millis(10));

        let wireless = config.wireless.gateway_config();
        assert_eq!(wireless.link_id, WIRELESS_LINK);
        assert_eq!(wireless.topics, vec![1400, 1401, 1402, 1601]);
        assert_eq!(wireless.report_interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DATALINK_NODE_ID", "7"),
            ("DATALINK_WIRELESS_PEER", "10.1.1.1:6000"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.node.id, 7);
        assert!(config.wireless.enabled);
        assert_eq!(config.wireless.peer, "10.1.1.1:6000");
        assert!(!config.serial.enabled);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| {
            (key == "DATALINK_METRICS_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_address_is_reported() {
        let config = WirelessConfig {
            bind: "nowhere".to_string(),
            ..WirelessConfig::default()
        };
        assert!(config.bind_addr().is_err());
    }
}
