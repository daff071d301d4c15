// src/config.rs
//! Server configuration.
//!
//! Loaded from a TOML file with two sections, `[general]` and `[turn]`. Every
//! field has a default so a missing or empty file yields a runnable server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// HTTP / signaling side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Domain used in `turns:` URIs
    pub domain: String,
    /// HTTP bind address
    pub bind: IpAddr,
    /// HTTP port
    pub port: u16,
    /// Directory of static web assets served at `/`
    pub html_root: Option<String>,
    /// Path of the signaling WebSocket
    pub signaling_path: String,
    /// Seconds without an inbound frame before a signaling connection is dropped
    pub idle_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".into(),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8086,
            html_root: None,
            signaling_path: "/ws".into(),
            idle_timeout_secs: 90,
        }
    }
}

impl GeneralConfig {
    /// Socket address the HTTP server listens on
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Idle timeout of signaling connections
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// TURN relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Start the STUN/TURN listeners
    pub enabled: bool,
    /// Listener bind address
    pub bind: IpAddr,
    /// Listener port (UDP, and TCP when enabled)
    pub port: u16,
    /// Address advertised to clients in URIs and relayed addresses
    pub public_ip: IpAddr,
    /// Realm for long-term credentials
    pub realm: String,
    /// Secret shared between the credential issuer and the TURN engine
    pub shared_secret: String,
    /// Lifetime of issued credentials
    pub credential_ttl_secs: u64,
    /// Address relay sockets are bound to
    pub relay_bind_ip: IpAddr,
    /// Lowest relay port
    pub relay_port_min: u16,
    /// Highest relay port
    pub relay_port_max: u16,
    /// Allocation lifetime when the client requests none
    pub default_lifetime_secs: u64,
    /// Upper bound for requested lifetimes
    pub max_lifetime_secs: u64,
    /// Reaper sweep interval
    pub reap_interval_secs: u64,
    /// Validity of issued nonces
    pub nonce_lifetime_secs: u64,
    /// Concurrent allocations allowed per username
    pub max_allocations_per_user: usize,
    /// Accept TURN over TCP on the same port
    pub enable_tcp: bool,
    /// TLS port advertised as `turns:` URI (TLS is terminated elsewhere)
    pub tls_port: Option<u16>,
    /// SOFTWARE attribute value
    pub software: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 19302,
            public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            realm: "flutter-webrtc".into(),
            shared_secret: "flutter-webrtc-turn-server-shared-key".into(),
            credential_ttl_secs: 86_400,
            relay_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            relay_port_min: 49_152,
            relay_port_max: 65_535,
            default_lifetime_secs: 600,
            max_lifetime_secs: 3_600,
            reap_interval_secs: 10,
            nonce_lifetime_secs: 3_600,
            max_allocations_per_user: 10,
            enable_tcp: false,
            tls_port: None,
            software: concat!("rtc-gateway/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl TurnConfig {
    /// Listener socket address
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn default_lifetime(&self) -> Duration {
        Duration::from_secs(self.default_lifetime_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn nonce_lifetime(&self) -> Duration {
        Duration::from_secs(self.nonce_lifetime_secs)
    }

    /// Relay URIs handed out with credentials
    pub fn relay_uris(&self, domain: &str) -> Vec<String> {
        let host = match self.public_ip {
            IpAddr::V6(ip) => format!("[{}]", ip),
            IpAddr::V4(ip) => ip.to_string(),
        };
        let mut uris = vec![format!("turn:{}:{}?transport=udp", host, self.port)];
        if self.enable_tcp {
            uris.push(format!("turn:{}:{}?transport=tcp", host, self.port));
        }
        if let Some(tls_port) = self.tls_port {
            uris.push(format!("turns:{}:{}?transport=tcp", domain, tls_port));
        }
        uris
    }
}

/// Complete server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub turn: TurnConfig,
}

impl ServerConfig {
    /// Load and validate a TOML configuration file
    pub fn load_from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text
    pub fn from_toml(text: &str) -> GatewayResult<Self> {
        let config: ServerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> GatewayResult<()> {
        let turn = &self.turn;
        if turn.shared_secret.is_empty() {
            return Err(GatewayError::Configuration("turn.shared_secret must not be empty".into()));
        }
        if turn.realm.is_empty() {
            return Err(GatewayError::Configuration("turn.realm must not be empty".into()));
        }
        if turn.relay_port_min == 0 || turn.relay_port_min > turn.relay_port_max {
            return Err(GatewayError::Configuration(format!(
                "invalid relay port range {}-{}",
                turn.relay_port_min, turn.relay_port_max
            )));
        }
        if turn.default_lifetime_secs == 0 || turn.max_lifetime_secs == 0 {
            return Err(GatewayError::Configuration("allocation lifetimes must be positive".into()));
        }
        if turn.default_lifetime_secs > turn.max_lifetime_secs {
            return Err(GatewayError::Configuration(
                "turn.default_lifetime_secs exceeds turn.max_lifetime_secs".into(),
            ));
        }
        if turn.credential_ttl_secs == 0 || turn.reap_interval_secs == 0 {
            return Err(GatewayError::Configuration(
                "credential ttl and reap interval must be positive".into(),
            ));
        }
        if turn.nonce_lifetime_secs == 0 || self.general.idle_timeout_secs == 0 {
            return Err(GatewayError::Configuration(
                "nonce lifetime and idle timeout must be positive".into(),
            ));
        }
        if !self.general.signaling_path.starts_with('/') {
            return Err(GatewayError::Configuration("general.signaling_path must start with '/'".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config.general.port, 8086);
        assert_eq!(config.turn.port, 19302);
        assert_eq!(config.turn.default_lifetime_secs, 600);
        assert_eq!(config.general.signaling_path, "/ws");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[general]
port = 9000

[turn]
public_ip = "203.0.113.7"
port = 3478
realm = "example.org"
shared_secret = "s3cret"
relay_port_min = 50000
relay_port_max = 50100
enable_tcp = true
"#
        )
        .unwrap();

        let config = ServerConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.general.port, 9000);
        assert_eq!(config.turn.realm, "example.org");
        assert_eq!(config.turn.relay_port_max, 50100);
        assert_eq!(
            config.turn.relay_uris("example.org"),
            vec![
                "turn:203.0.113.7:3478?transport=udp".to_string(),
                "turn:203.0.113.7:3478?transport=tcp".to_string(),
            ]
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(ServerConfig::from_toml("[turn]\nshared_secret = \"\"").is_err());
        assert!(ServerConfig::from_toml("[turn]\nrelay_port_min = 6000\nrelay_port_max = 5000").is_err());
        assert!(ServerConfig::from_toml("[turn]\ndefault_lifetime_secs = 7200").is_err());
        assert!(ServerConfig::from_toml("[general]\nsignaling_path = \"ws\"").is_err());
    }

    #[test]
    fn test_turns_uri_uses_domain() {
        let mut turn = TurnConfig::default();
        turn.tls_port = Some(5349);
        let uris = turn.relay_uris("turn.example.org");
        assert_eq!(uris.last().unwrap(), "turns:turn.example.org:5349?transport=tcp");
    }
}
