use messenger_types::MessengerError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name shown as the sender on outgoing messages.
    pub display_name: String,
    /// TCP port to accept peer connections on. 0 picks a free port.
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Peers dialed at startup, as host:port strings.
    pub bootstrap_peers: Vec<String>,
    /// UDP port for presence broadcasts.
    pub discovery_port: u16,
    pub enable_discovery: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub file: String,
    /// How many messages `/history` shows.
    pub display_limit: usize,
}

impl AppConfig {
    pub fn load() -> Result<Self, MessengerError> {
        let mut app_config = AppConfig {
            node: NodeConfig {
                display_name: whoami(),
                listen_port: 5000,
            },
            network: NetworkConfig {
                bootstrap_peers: vec![],
                discovery_port: 5001,
                enable_discovery: true,
            },
            history: HistoryConfig {
                file: "message_history.json".to_string(),
                display_limit: 20,
            },
        };

        // Config file, if present.
        if Path::new("config/default.toml").exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name("config/default"))
                .build()
                .map_err(|e| {
                    MessengerError::ConfigError(format!("Failed to load config file: {}", e))
                })?;

            if let Ok(file_config) = settings.try_deserialize::<AppConfig>() {
                app_config = file_config;
            }
        }

        Self::override_from_env(&mut app_config)?;

        Ok(app_config)
    }

    fn override_from_env(config: &mut AppConfig) -> Result<(), MessengerError> {
        if let Ok(name) = std::env::var("MESSENGER_NAME") {
            config.node.display_name = name;
        }

        if let Ok(listen_port) = std::env::var("LISTEN_PORT") {
            config.node.listen_port = listen_port
                .parse()
                .map_err(|e| MessengerError::ConfigError(format!("Invalid LISTEN_PORT: {}", e)))?;
        }

        if let Ok(discovery_port) = std::env::var("DISCOVERY_PORT") {
            config.network.discovery_port = discovery_port.parse().map_err(|e| {
                MessengerError::ConfigError(format!("Invalid DISCOVERY_PORT: {}", e))
            })?;
        }

        if let Ok(enable) = std::env::var("ENABLE_DISCOVERY") {
            config.network.enable_discovery = enable
                .parse()
                .map_err(|e| MessengerError::ConfigError(format!("Invalid ENABLE_DISCOVERY: {}", e)))?;
        }

        if let Ok(bootstrap_peers) = std::env::var("BOOTSTRAP_PEERS") {
            if !bootstrap_peers.is_empty() {
                config.network.bootstrap_peers = bootstrap_peers
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
        }

        if let Ok(history_file) = std::env::var("HISTORY_FILE") {
            config.history.file = history_file;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), MessengerError> {
        if self.node.display_name.trim().is_empty() {
            return Err(MessengerError::ConfigError(
                "display_name cannot be empty".to_string(),
            ));
        }

        if self.network.enable_discovery
            && self.node.listen_port != 0
            && self.node.listen_port == self.network.discovery_port
        {
            return Err(MessengerError::ConfigError(
                "listen_port and discovery_port cannot be the same".to_string(),
            ));
        }

        if self.history.file.is_empty() {
            return Err(MessengerError::ConfigError(
                "history file cannot be empty".to_string(),
            ));
        }

        // Every bootstrap address must parse up front.
        self.bootstrap_peers()?;

        Ok(())
    }

    /// Bootstrap addresses as (host, port) pairs.
    pub fn bootstrap_peers(&self) -> Result<Vec<(String, u16)>, MessengerError> {
        self.network
            .bootstrap_peers
            .iter()
            .map(|addr| {
                let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
                    MessengerError::ConfigError(format!(
                        "Invalid bootstrap peer {}: expected host:port",
                        addr
                    ))
                })?;
                let port = port.parse().map_err(|e| {
                    MessengerError::ConfigError(format!("Invalid bootstrap peer {}: {}", addr, e))
                })?;
                Ok((host.to_string(), port))
            })
            .collect()
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "anonymous".to_string())
}
