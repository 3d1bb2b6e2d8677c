//! 配置管理模块

use crate::replication::role::{NodeInfo, Role};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid argument {flag}: {message}")]
    InvalidArgument { flag: String, message: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshgateConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub xds: XdsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl MeshgateConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load_from_file("config/meshgate.toml")
    }

    /// 命令行参数覆盖
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(role) = args.role {
            self.node.initial_role = role;
        }
        if let Some(port) = args.xds_port {
            self.xds.port = port;
        }
        if let Some(port) = args.bus_port {
            self.node.bus_port = port;
        }
        if let Some(address) = &args.master_address {
            self.node.master_address = address.clone();
        }
    }

    /// 命令行覆盖之后、启动之前调用
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replication.send_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "replication.send_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.xds.keepalive_interval_s == 0 || self.xds.keepalive_timeout_s == 0 {
            return Err(ConfigError::Invalid(
                "xds keepalive interval and timeout must be greater than 0".to_string(),
            ));
        }
        if self.xds.keepalive_timeout_s >= self.xds.keepalive_interval_s {
            return Err(ConfigError::Invalid(format!(
                "xds.keepalive_timeout_s ({}) must be shorter than keepalive_interval_s ({})",
                self.xds.keepalive_timeout_s, self.xds.keepalive_interval_s
            )));
        }
        if !self.node.master_address.is_empty() {
            self.node.master_info()?;
        }
        if self.node.initial_role == Role::Slave {
            let master = self.node.master_info()?.ok_or_else(|| {
                ConfigError::Invalid("initial_role = slave requires node.master_address".to_string())
            })?;
            if master.bus_address() == self.node.node_info().bus_address() {
                return Err(ConfigError::Invalid(format!(
                    "node.master_address {} is this node's own bus address",
                    self.node.master_address
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// 各配置段
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 为空时使用主机名或随机 ID
    #[serde(default)]
    pub pod_id: String,
    /// "disabled" | "permissive" | "strict"
    #[serde(default = "default_tls_mode")]
    pub tls_mode: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            environment: default_environment(),
            log_level: default_log_level(),
            pod_id: String::new(),
            tls_mode: default_tls_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_swim_port")]
    pub swim_port: u16,
    #[serde(default = "default_bus_port")]
    pub bus_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// 成员管理模块给出角色之前使用的角色
    #[serde(default = "default_initial_role")]
    pub initial_role: Role,
    /// 主节点复制总线地址 (ip:bus_port)，初始角色为 slave 时必填
    #[serde(default)]
    pub master_address: String,
}

impl NodeConfig {
    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            ip: self.ip.clone(),
            swim_port: self.swim_port,
            bus_port: self.bus_port,
            http_port: self.http_port,
        }
    }

    /// 由 `master_address` 构造主节点信息；未配置时返回 `None`
    ///
    /// 其余端口沿用本节点的配置。
    pub fn master_info(&self) -> Result<Option<NodeInfo>, ConfigError> {
        if self.master_address.is_empty() {
            return Ok(None);
        }
        let invalid = || {
            ConfigError::Invalid(format!(
                "node.master_address {} is not ip:port",
                self.master_address
            ))
        };
        let (ip, port) = self.master_address.rsplit_once(':').ok_or_else(invalid)?;
        if ip.is_empty() {
            return Err(invalid());
        }
        let bus_port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Some(NodeInfo {
            ip: ip.to_string(),
            swim_port: self.swim_port,
            bus_port,
            http_port: self.http_port,
        }))
    }

    /// 应用初始角色时使用的节点信息：slave 指向主节点，其余角色指向本节点
    pub fn initial_role_target(&self) -> Result<NodeInfo, ConfigError> {
        match self.initial_role {
            Role::Slave => self.master_info()?.ok_or_else(|| {
                ConfigError::Invalid("initial_role = slave requires node.master_address".to_string())
            }),
            _ => Ok(self.node_info()),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            swim_port: default_swim_port(),
            bus_port: default_bus_port(),
            http_port: default_http_port(),
            initial_role: default_initial_role(),
            master_address: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_send_interval")]
    pub send_interval_ms: u64,
    #[serde(default = "default_receive_queue_capacity")]
    pub receive_queue_capacity: usize,
    #[serde(default)]
    pub init_retry: RetryConfig,
}

impl ReplicationConfig {
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: default_send_interval(),
            receive_queue_capacity: default_receive_queue_capacity(),
            init_retry: RetryConfig::default(),
        }
    }
}

/// 退避重试参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_initial")]
    pub initial_ms: u64,
    #[serde(default = "default_retry_max")]
    pub max_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_retry_initial(),
            max_ms: default_retry_max(),
            max_attempts: default_retry_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XdsConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_xds_port")]
    pub port: u16,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_s: u64,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_s: u64,
    #[serde(default = "default_max_error_message_len")]
    pub max_error_message_len: usize,
}

impl XdsConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_xds_port(),
            keepalive_interval_s: default_keepalive_interval(),
            keepalive_timeout_s: default_keepalive_timeout(),
            max_error_message_len: default_max_error_message_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            flush_interval_ms: default_flush_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// 为空时不启动通知监听
    #[serde(default)]
    pub channel: String,
    /// 通知源地址 (host:port)
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel: String::new(),
            address: String::new(),
            reconnect_backoff_ms: default_reconnect_backoff(),
        }
    }
}

// 默认值函数
fn default_name() -> String {
    "meshgate".to_string()
}
fn default_environment() -> String {
    "development".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_tls_mode() -> String {
    "disabled".to_string()
}
fn default_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_swim_port() -> u16 {
    7946
}
fn default_bus_port() -> u16 {
    5555
}
fn default_http_port() -> u16 {
    8080
}
fn default_initial_role() -> Role {
    Role::Phantom
}
fn default_send_interval() -> u64 {
    1000
}
fn default_receive_queue_capacity() -> usize {
    64
}
fn default_retry_initial() -> u64 {
    200
}
fn default_retry_max() -> u64 {
    10_000
}
fn default_retry_attempts() -> u32 {
    10
}
fn default_xds_port() -> u16 {
    18000
}
fn default_keepalive_interval() -> u64 {
    30
}
fn default_keepalive_timeout() -> u64 {
    5
}
fn default_max_error_message_len() -> usize {
    512
}
fn default_snapshot_path() -> String {
    "./data/meshgate.snap".to_string()
}
fn default_flush_interval() -> u64 {
    5000
}
fn default_reconnect_backoff() -> u64 {
    5000
}

// ============================================================================
// 命令行参数
// ============================================================================

/// 命令行参数（`--config`, `--role`, `--xds-port`, `--bus-port`, `--master-address`）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub config: Option<String>,
    pub role: Option<Role>,
    pub xds_port: Option<u16>,
    pub bus_port: Option<u16>,
    pub master_address: Option<String>,
}

impl CliArgs {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::parse(std::env::args().skip(1))
    }

    pub fn parse<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let mut parsed = CliArgs::default();
        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            let next = args.get(i + 1).cloned();
            let value = || {
                next.clone().ok_or_else(|| ConfigError::InvalidArgument {
                    flag: flag.to_string(),
                    message: "missing value".to_string(),
                })
            };
            match flag {
                "--config" | "-c" => parsed.config = Some(value()?),
                "--role" => {
                    let v = value()?;
                    let role = v.parse::<Role>().map_err(|message| ConfigError::InvalidArgument {
                        flag: flag.to_string(),
                        message,
                    })?;
                    parsed.role = Some(role);
                }
                "--xds-port" => parsed.xds_port = Some(parse_port(flag, &value()?)?),
                "--bus-port" => parsed.bus_port = Some(parse_port(flag, &value()?)?),
                "--master-address" => parsed.master_address = Some(value()?),
                other => {
                    log::warn!("Ignoring unknown argument: {}", other);
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }
        Ok(parsed)
    }
}

fn parse_port(flag: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|e| ConfigError::InvalidArgument {
        flag: flag.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: MeshgateConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.node.initial_role, Role::Phantom);
        assert_eq!(config.xds.port, 18000);
        assert_eq!(config.replication.init_retry.max_attempts, 10);
    }

    #[test]
    fn test_partial_sections() {
        let config: MeshgateConfig = toml::from_str(
            r#"
            [node]
            ip = "10.0.0.5"
            bus_port = 6000
            initial_role = "master"

            [xds]
            keepalive_interval_s = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.node.node_info().bus_address(), "10.0.0.5:6000");
        assert_eq!(config.node.initial_role, Role::Master);
        assert_eq!(config.xds.keepalive_interval_s, 10);
        assert_eq!(config.xds.keepalive_timeout_s, 5);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshgate.toml");
        std::fs::write(&path, "[server]\npod_id = \"pod-a\"\n").unwrap();
        let config = MeshgateConfig::load_from_file(&path).unwrap();
        assert_eq!(config.server.pod_id, "pod-a");

        let missing = MeshgateConfig::load_from_file(dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_cli_overrides() {
        let args = CliArgs::parse([
            "--config", "a.toml", "--role", "slave", "--xds-port", "19000", "--bus-port", "7000",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some("a.toml"));

        let mut config = MeshgateConfig::default();
        config.apply_cli(&args);
        assert_eq!(config.node.initial_role, Role::Slave);
        assert_eq!(config.xds.port, 19000);
        assert_eq!(config.node.bus_port, 7000);
    }

    #[test]
    fn test_slave_targets_master_address() {
        let config: MeshgateConfig = toml::from_str(
            r#"
            [node]
            ip = "10.0.0.6"
            bus_port = 5555
            initial_role = "slave"
            master_address = "10.0.0.5:6000"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        let target = config.node.initial_role_target().unwrap();
        assert_eq!(target.bus_address(), "10.0.0.5:6000");
        assert_eq!(config.node.node_info().bus_address(), "10.0.0.6:5555");
    }

    #[test]
    fn test_slave_without_master_is_rejected() {
        let mut config = MeshgateConfig::default();
        config.apply_cli(&CliArgs::parse(["--role", "slave"]).unwrap());

        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(config.node.initial_role_target().is_err());

        config.apply_cli(&CliArgs::parse(["--master-address", "10.0.0.9:5555"]).unwrap());
        config.validate().unwrap();
        assert_eq!(
            config.node.initial_role_target().unwrap().bus_address(),
            "10.0.0.9:5555"
        );
    }

    #[test]
    fn test_slave_of_itself_is_rejected() {
        let mut config = MeshgateConfig::default();
        config.node.initial_role = Role::Slave;
        config.node.master_address = config.node.node_info().bus_address();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_master_ignores_master_address() {
        let mut config = MeshgateConfig::default();
        config.node.initial_role = Role::Master;
        config.node.master_address = "10.0.0.9:5555".to_string();
        config.validate().unwrap();
        assert_eq!(
            config.node.initial_role_target().unwrap(),
            config.node.node_info()
        );
    }

    #[test]
    fn test_bad_master_address_is_rejected() {
        for address in ["10.0.0.9", ":5555", "10.0.0.9:port", "10.0.0.9:70000"] {
            let mut config = MeshgateConfig::default();
            config.node.master_address = address.to_string();
            assert!(config.validate().is_err(), "{}", address);
        }
    }

    #[test]
    fn test_zero_send_interval_is_rejected() {
        let config: MeshgateConfig =
            toml::from_str("[replication]\nsend_interval_ms = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        MeshgateConfig::default().validate().unwrap();
    }

    #[test]
    fn test_keepalive_settings_are_checked() {
        let mut config = MeshgateConfig::default();
        config.xds.keepalive_interval_s = 0;
        assert!(config.validate().is_err());

        config.xds.keepalive_interval_s = 5;
        config.xds.keepalive_timeout_s = 5;
        assert!(config.validate().is_err());

        config.xds.keepalive_timeout_s = 2;
        config.validate().unwrap();
    }

    #[test]
    fn test_cli_rejects_bad_values() {
        assert!(CliArgs::parse(["--xds-port", "abc"]).is_err());
        assert!(CliArgs::parse(["--role"]).is_err());
        assert!(CliArgs::parse(["--role", "leader"]).is_err());
    }
}
