use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_tls::TlsSettings;
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub ingest: IngestConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    #[serde(alias = "ws", alias = "websocket")]
    Websockets,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub transport: Transport,
    /// Request path for WebSocket transports
    pub ws_path: String,
    pub tls: bool,
    /// Accept any server certificate
    pub tls_insecure: bool,
    pub ca_file: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// How long `connect` waits for the broker's acknowledgment
    pub connect_timeout_secs: u64,
    pub reconnect_min_delay_secs: u64,
    pub reconnect_max_delay_secs: u64,
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn tls_settings(&self) -> TlsSettings {
        TlsSettings {
            ca_file: self.ca_file.clone(),
            client_cert: self.client_cert.clone(),
            client_key: self.client_key.clone(),
            insecure: self.tls_insecure,
        }
    }

    /// Plain WebSockets on 443 almost always means a TLS-terminating proxy.
    pub fn should_retry_with_tls(&self) -> bool {
        self.port == 443 && self.transport == Transport::Websockets && !self.tls
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "fleet_ingest".to_string(),
            keep_alive_secs: 60,
            clean_session: true,
            transport: Transport::Tcp,
            ws_path: "/mqtt".to_string(),
            tls: false,
            tls_insecure: false,
            ca_file: None,
            client_cert: None,
            client_key: None,
            connect_timeout_secs: 10,
            reconnect_min_delay_secs: 1,
            reconnect_max_delay_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Topic filters to subscribe to; a single comma or semicolon separated string also works
    #[serde(deserialize_with = "topic_list")]
    pub topics: Vec<String>,
    /// Requested QoS, clamped to 0..=2
    pub qos: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            qos: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    /// Decode and log only
    #[default]
    Disabled,
    Sqlite(SqliteConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub path: PathBuf,
    /// Probe the database once before connecting to the broker
    pub connect_on_start: bool,
    /// Abort startup if that probe fails
    pub connect_required: bool,
    pub apply_schema: bool,
    pub busy_timeout_secs: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fleet-ingest.db"),
            connect_on_start: false,
            connect_required: false,
            apply_schema: true,
            busy_timeout_secs: 5,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TopicList {
    Joined(String),
    List(Vec<String>),
}

fn topic_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let topics = match TopicList::deserialize(deserializer)? {
        TopicList::Joined(joined) => joined
            .split([',', ';'])
            .map(|t| t.trim().to_string())
            .collect::<Vec<_>>(),
        TopicList::List(list) => list.into_iter().map(|t| t.trim().to_string()).collect(),
    };
    Ok(topics.into_iter().filter(|t| !t.is_empty()).collect())
}
