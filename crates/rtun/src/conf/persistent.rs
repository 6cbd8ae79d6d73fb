use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use educe::Educe;
use figment::providers::{Env, Format, Toml, Yaml};
use figment::Figment;
use rtun_client::HostPatternSpec;
use rtun_core::types::OpenPortSpec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct PersistentConfig {
    pub gateway: GatewayOpt,
    pub client: ClientOpt,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct GatewayOpt {
    #[educe(Default(expression = "0.0.0.0:7890".parse().unwrap()))]
    pub listen_addr: SocketAddr,

    pub transport: TransportKind,

    #[educe(Default = None)]
    pub tls_cert_path: Option<PathBuf>,

    #[educe(Default = None)]
    pub tls_key_path: Option<PathBuf>,

    pub credentials: CredentialBackendConfig,

    #[serde(with = "humantime_serde")]
    #[educe(Default(expression = Duration::from_secs(30)))]
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct ClientOpt {
    #[educe(Default = "ws://127.0.0.1:7890")]
    pub gateway_addr: String,

    pub transport: TransportKind,

    #[educe(Default = "default")]
    pub group_id: String,

    #[educe(Default = "")]
    pub group_password: String,

    #[educe(Default = "")]
    pub username: String,

    #[educe(Default = "")]
    pub password: String,

    pub allowed_hosts: Vec<HostPatternSpec>,

    pub forbidden_hosts: Vec<HostPatternSpec>,

    pub open_ports: Vec<OpenPortSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[educe(Default)]
    WebSocket,
    Grpc,
    Quic,
}

#[derive(Clone, Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum CredentialBackendConfig {
    #[educe(Default)]
    Memory,
    File {
        path: PathBuf,
    },
    #[cfg(feature = "sql-credentials")]
    Sql {
        database_url: String,
        table: String,
    },
}

impl PersistentConfig {
    pub fn export_to_file(&self, path: &PathBuf, format: &str) -> eyre::Result<()> {
        use std::fs;
        use std::io::Write;

        match format.to_lowercase().as_str() {
            "yaml" => {
                let content = serde_yaml::to_string(self)?;
                fs::File::create(path)?.write_all(content.as_bytes())?;
            }
            "toml" => {
                let content = toml::to_string_pretty(self)?;
                fs::File::create(path)?.write_all(content.as_bytes())?;
            }
            other => return Err(eyre::eyre!("unsupported config file format: {other}")),
        }
        Ok(())
    }

    pub fn load(config_path: Option<String>, config_dir: Option<PathBuf>) -> eyre::Result<Self> {
        let mut figment = Figment::new();

        if let Some(config_dir) = config_dir {
            let toml_file = config_dir.join("config.toml");
            if toml_file.exists() {
                figment = figment.merge(Toml::file(toml_file));
            }
            let yaml_file = config_dir.join("config.yaml");
            if yaml_file.exists() {
                figment = figment.merge(Yaml::file(yaml_file));
            }
        } else {
            let toml_file = std::path::Path::new("config.toml");
            if toml_file.exists() {
                figment = figment.merge(Toml::file(toml_file));
            }
            let yaml_file = std::path::Path::new("config.yaml");
            if yaml_file.exists() {
                figment = figment.merge(Yaml::file(yaml_file));
            }
        }

        if let Some(config_path) = config_path {
            if config_path.ends_with(".toml") {
                figment = figment.merge(Toml::file(config_path));
            } else if config_path.ends_with(".yaml") || config_path.ends_with(".yml") {
                figment = figment.merge(Yaml::file(config_path));
            } else {
                figment = figment.merge(Toml::file(config_path));
            }
        }

        figment = figment.merge(Env::prefixed("RTUN_").split("__"));

        Ok(figment.extract()?)
    }
}
