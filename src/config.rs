use crate::Result;
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top level gateway configuration, loaded from a nested TOML file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sip: SipConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// REST/webhook listen port.
    pub http_port: u16,
    /// Secret checked against the `sign` parameter of RTMP publishes.
    pub rtmp_secret: String,
    pub jwt_secret: String,
    pub pprof: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 15123,
            rtmp_secret: String::new(),
            jwt_secret: String::new(),
            pprof: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SipConfig {
    /// UDP and TCP listen port.
    pub port: u16,
    /// 20-digit GB28181 server identifier.
    pub id: String,
    /// 10-digit domain prefix, also the digest realm.
    pub domain: String,
    /// Registration password. Empty disables digest authentication.
    pub password: String,
    /// Default registration lifetime in seconds.
    pub register_expires: u32,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            port: 15060,
            id: "34020000002000000001".to_string(),
            domain: "3402000000".to_string(),
            password: String::new(),
            register_expires: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MediaConfig {
    /// Media relay address as seen from the gateway.
    pub ip: String,
    pub http_port: u16,
    /// ZLMediaKit api secret.
    pub secret: String,
    /// Address the relay posts webhooks to.
    pub webhook_ip: String,
    /// Address placed into SDP offers; may be a domain name.
    pub sdp_ip: String,
    pub rtp_port_min: u16,
    pub rtp_port_max: u16,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            http_port: 80,
            secret: String::new(),
            webhook_ip: "127.0.0.1".to_string(),
            sdp_ip: "127.0.0.1".to_string(),
            rtp_port_min: 20000,
            rtp_port_max: 20300,
        }
    }
}

/// Consumed by the repository layer; the core only carries it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub dsn: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    /// Milliseconds above which a query is logged as slow.
    pub slow_threshold_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: "gbgate.db".to_string(),
            max_open_conns: 10,
            max_idle_conns: 2,
            slow_threshold_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    pub level: String,
    pub dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: "logs".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::from(path.as_ref()).format(FileFormat::Toml))
            .build()
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        cfg.try_deserialize()
            .map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Relay api base, e.g. `http://127.0.0.1:80`.
    pub fn media_api_url(&self) -> String {
        format!("http://{}:{}", self.media.ip, self.media.http_port)
    }
}
