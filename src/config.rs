//! Configuration management for the peerlink daemon.
//!
//! A single TOML file with `[node]`, `[network]`, `[admission]` and
//! `[logging]` tables. Every field has a default so partial files load.
//! On first run `load_or_create` writes a complete file, including a freshly
//! generated node UUID that stays stable across restarts.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppError;
use crate::network::admission::AdmissionSettings;
use crate::network::connector::ConnectorSettings;
use crate::network::endpoint::{Endpoint, IpMode};
use crate::network::handshake::CompressionMode;
use crate::network::server::ServerSettings;
use crate::network::transport::TransportStrategy;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub name: String,
    /// Empty means "generate one on first run".
    #[serde(default)]
    pub peer_uuid: String,
    /// Opaque bytes sent to peers at the end of the handshake.
    #[serde(default = "default_handshake_payload")]
    pub handshake_payload: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            peer_uuid: String::new(),
            handshake_payload: default_handshake_payload(),
        }
    }
}

fn default_node_name() -> String {
    "peerlink node".to_string()
}

fn default_handshake_payload() -> String {
    format!("peerlink/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub server_ip_mode: IpMode,
    #[serde(default)]
    pub client_ip_mode: IpMode,
    #[serde(default = "default_true")]
    pub enable_dual_socket: bool,
    #[serde(default)]
    pub force_ipv4: bool,
    #[serde(default = "default_true")]
    pub ipv6_enabled: bool,
    #[serde(default)]
    pub transport: TransportStrategy,
    #[serde(default)]
    pub compression: CompressionMode,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_read_cycle_ms")]
    pub read_cycle_ms: u64,
    #[serde(default = "default_inline_limit")]
    pub inline_limit_bytes: usize,
    #[serde(default = "default_send_cache_capacity")]
    pub send_cache_capacity: usize,
    #[serde(default = "default_send_cache_ttl_secs")]
    pub send_cache_ttl_secs: u64,
    #[serde(default = "default_keepalive_sweep_secs")]
    pub keepalive_sweep_secs: u64,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_port(),
            server_ip_mode: IpMode::Both,
            client_ip_mode: IpMode::Both,
            enable_dual_socket: true,
            force_ipv4: false,
            ipv6_enabled: true,
            transport: TransportStrategy::default(),
            compression: CompressionMode::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            read_cycle_ms: default_read_cycle_ms(),
            inline_limit_bytes: default_inline_limit(),
            send_cache_capacity: default_send_cache_capacity(),
            send_cache_ttl_secs: default_send_cache_ttl_secs(),
            keepalive_sweep_secs: default_keepalive_sweep_secs(),
            bootstrap_peers: vec![],
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    24100
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_read_cycle_ms() -> u64 {
    2000
}

fn default_inline_limit() -> usize {
    256 * 1024
}

fn default_send_cache_capacity() -> usize {
    256
}

fn default_send_cache_ttl_secs() -> u64 {
    300
}

fn default_keepalive_sweep_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acceptance {
    /// Exempt from rate limiting and bans
    Whitelist,
    /// Never accepted
    Blacklist,
}

/// An address or CIDR network with an acceptance type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub address: String,
    pub acceptance: Acceptance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionProfile {
    #[default]
    General,
    Strict,
}

/// Admission policy for the listener. Every numeric field is an optional
/// override on top of the selected profile.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub profile: AdmissionProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_strikes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_strikes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_penalty_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blacklist_strikes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_refusal_strikes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_period_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forget_after_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_duration_secs: Option<u64>,
    #[serde(default)]
    pub access_rules: Vec<AccessRule>,
}

impl AdmissionConfig {
    /// Settings for `profile`, with this config's overrides applied.
    pub fn settings_for(&self, profile: AdmissionProfile) -> AdmissionSettings {
        let mut settings = match profile {
            AdmissionProfile::General => AdmissionSettings::general(),
            AdmissionProfile::Strict => AdmissionSettings::strict(),
        };
        let secs = Duration::from_secs;
        if let Some(v) = self.min_interval_secs {
            settings.min_interval = secs(v);
        }
        if let Some(v) = self.grace_strikes {
            settings.grace_strikes = v;
        }
        if let Some(v) = self.rate_limit_strikes {
            settings.rate_limit_strikes = v.max(1);
        }
        if let Some(v) = self.rate_limit_penalty_secs {
            settings.rate_limit_penalty = secs(v);
        }
        if let Some(v) = self.blacklist_strikes {
            settings.blacklist_strikes = v.max(1);
        }
        if let Some(v) = self.connection_refusal_strikes {
            settings.connection_refusal_strikes = v;
        }
        if let Some(v) = self.cleanup_period_secs {
            settings.cleanup_period = secs(v);
        }
        if let Some(v) = self.forget_after_secs {
            settings.forget_after = secs(v);
        }
        if let Some(v) = self.quarantine_duration_secs {
            settings.quarantine_duration = secs(v);
        }
        settings
    }

    pub fn settings(&self) -> AdmissionSettings {
        self.settings_for(self.profile)
    }

    /// Split the access rules into (whitelist, blacklist) networks.
    pub fn access_lists(&self) -> Result<(Vec<IpNet>, Vec<IpNet>), AppError> {
        let mut whitelist = Vec::new();
        let mut blacklist = Vec::new();
        for rule in &self.access_rules {
            let net = parse_network(&rule.address)?;
            match rule.acceptance {
                Acceptance::Whitelist => whitelist.push(net),
                Acceptance::Blacklist => blacklist.push(net),
            }
        }
        Ok((whitelist, blacklist))
    }
}

/// Parse `a.b.c.d`, `a.b.c.d/len` or the IPv6 equivalents.
pub fn parse_network(address: &str) -> Result<IpNet, AppError> {
    let address = address.trim();
    if let Ok(net) = address.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    let ip: IpAddr = address
        .parse()
        .map_err(|_| AppError::Config(format!("Invalid address or network '{}'", address)))?;
    let host_len = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    IpNet::new(ip, host_len).map_err(|e| AppError::Config(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
    /// "stdout" or "file"
    #[serde(default = "default_log_output")]
    pub output: String,
    #[serde(default = "default_log_file_path")]
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            file_path: default_log_file_path(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_log_file_path() -> String {
    "./logs/peerlink.log".to_string()
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load `path`, or write a default config there if it doesn't exist.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        if path.exists() {
            let mut config = Self::load_from_file(path)?;
            if config.node.peer_uuid.trim().is_empty() {
                config.node.peer_uuid = Uuid::new_v4().to_string();
                config.save_to_file(path)?;
                tracing::info!("🆔 Generated node UUID {}", config.node.peer_uuid);
            }
            return Ok(config);
        }

        let mut config = Config::default();
        config.node.peer_uuid = Uuid::new_v4().to_string();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        config.save_to_file(path)?;
        tracing::info!("📝 Wrote default configuration to {}", path.display());
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn peer_uuid(&self) -> Result<Uuid, AppError> {
        Uuid::parse_str(self.node.peer_uuid.trim())
            .map_err(|e| AppError::Config(format!("Invalid node.peer_uuid: {}", e)))
    }

    /// `None` for an unspecified address so the server picks per IP mode.
    pub fn listen_ip(&self) -> Result<Option<IpAddr>, AppError> {
        let raw = self.network.listen_address.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let ip: IpAddr = raw
            .parse()
            .map_err(|_| AppError::Config(format!("Invalid listen_address '{}'", raw)))?;
        Ok(if ip.is_unspecified() { None } else { Some(ip) })
    }

    pub fn server_settings(&self) -> Result<ServerSettings, AppError> {
        Ok(ServerSettings {
            listen_address: self.listen_ip()?,
            port: self.network.port,
            ip_mode: self.network.server_ip_mode,
            ipv6_enabled: self.network.ipv6_enabled && !self.network.force_ipv4,
        })
    }

    pub fn connector_settings(&self) -> ConnectorSettings {
        ConnectorSettings {
            enable_dual_socket: self.network.enable_dual_socket,
            force_ipv4: self.network.force_ipv4,
            ipv6_enabled: self.network.ipv6_enabled,
            ..ConnectorSettings::default()
        }
    }

    /// Bootstrap peers as endpoints restricted to the client IP mode.
    pub fn bootstrap_endpoints(&self) -> Result<Vec<Endpoint>, AppError> {
        self.network
            .bootstrap_peers
            .iter()
            .map(|peer| {
                let endpoint: Endpoint = peer.parse().map_err(AppError::Config)?;
                Ok(Endpoint::new(
                    endpoint.host(),
                    endpoint.port(),
                    self.network.client_ip_mode,
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [network]
            port = 9999
            transport = "stream"
            server_ip_mode = "ipv4"
            "#,
        )
        .unwrap();
        assert_eq!(config.network.port, 9999);
        assert_eq!(config.network.transport, TransportStrategy::Stream);
        assert_eq!(config.network.server_ip_mode, IpMode::V4);
        assert_eq!(config.network.handshake_timeout_secs, 30);
        assert_eq!(config.admission.profile, AdmissionProfile::General);
        assert_eq!(config.admission.settings().rate_limit_strikes, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_admission_overrides_apply_to_profile() {
        let config: Config = toml::from_str(
            r#"
            [admission]
            profile = "strict"
            rate_limit_strikes = 4
            "#,
        )
        .unwrap();
        let settings = config.admission.settings();
        assert_eq!(settings.rate_limit_strikes, 4);
        assert_eq!(
            settings.rate_limit_penalty,
            AdmissionSettings::strict().rate_limit_penalty
        );

        let general = config.admission.settings_for(AdmissionProfile::General);
        assert_eq!(general.rate_limit_strikes, 4);
        assert_eq!(general.blacklist_strikes, AdmissionSettings::general().blacklist_strikes);
    }

    #[test]
    fn test_load_or_create_persists_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("peerlink.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        let uuid = created.peer_uuid().unwrap();

        let reloaded = Config::load_or_create(&path).unwrap();
        assert_eq!(reloaded.peer_uuid().unwrap(), uuid);
    }

    #[test]
    fn test_access_rules() {
        let config: Config = toml::from_str(
            r#"
            [[admission.access_rules]]
            address = "10.0.0.0/8"
            acceptance = "whitelist"

            [[admission.access_rules]]
            address = "198.51.100.7"
            acceptance = "blacklist"

            [[admission.access_rules]]
            address = "2001:db8::/32"
            acceptance = "blacklist"
            "#,
        )
        .unwrap();
        let (whitelist, blacklist) = config.admission.access_lists().unwrap();
        assert_eq!(whitelist.len(), 1);
        assert_eq!(blacklist.len(), 2);
        assert!(blacklist[0].contains(&"198.51.100.7".parse::<IpAddr>().unwrap()));
        assert!(!blacklist[0].contains(&"198.51.100.8".parse::<IpAddr>().unwrap()));

        assert!(parse_network("not-an-ip").is_err());
        assert!(parse_network("10.0.0.0/33").is_err());
    }

    #[test]
    fn test_listen_and_bootstrap() {
        let mut config = Config::default();
        assert_eq!(config.listen_ip().unwrap(), None);
        config.network.listen_address = "127.0.0.1".to_string();
        assert!(config.listen_ip().unwrap().is_some());

        config.network.client_ip_mode = IpMode::V4;
        config.network.bootstrap_peers = vec!["seed.example.org:24100".to_string()];
        let endpoints = config.bootstrap_endpoints().unwrap();
        assert_eq!(endpoints[0].ip_mode(), IpMode::V4);

        config.network.bootstrap_peers = vec!["missing-port".to_string()];
        assert!(config.bootstrap_endpoints().is_err());
    }
}
