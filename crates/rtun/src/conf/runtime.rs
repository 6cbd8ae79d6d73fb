use std::path::PathBuf;
use std::time::Duration;

use rtun_client::{HostPolicy, PolicyError};
use rtun_core::error::ErrorKind;
use rtun_core::transport::HandshakeMeta;
use rtun_core::types::{ClientId, GroupId, OpenPortSpec};
use std::net::SocketAddr;

use super::persistent::{ClientOpt, CredentialBackendConfig, GatewayOpt, PersistentConfig, TransportKind};

pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub transport: TransportKind,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub credentials: CredentialBackendConfig,
    pub shutdown_timeout: Duration,
}

pub struct ClientConfig {
    pub gateway_addr: String,
    pub transport: TransportKind,
    pub handshake: HandshakeMeta,
    pub policy: HostPolicy,
    pub open_ports: Vec<OpenPortSpec>,
}

pub struct Config {
    pub gateway: GatewayConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Validates and parses the raw figment-extracted shape into the typed config both
    /// run modes consume: compiles the host policy, parses the group id, and builds the
    /// handshake identity a Private Client presents on dial.
    pub fn from_persist(persistent: PersistentConfig) -> Result<Self, ErrorKind> {
        let PersistentConfig { gateway, client } = persistent;
        Ok(Self { gateway: gateway_from_persist(gateway), client: client_from_persist(client)? })
    }
}

fn gateway_from_persist(opt: GatewayOpt) -> GatewayConfig {
    GatewayConfig {
        listen_addr: opt.listen_addr,
        transport: opt.transport,
        tls_cert_path: opt.tls_cert_path,
        tls_key_path: opt.tls_key_path,
        credentials: opt.credentials,
        shutdown_timeout: opt.shutdown_timeout,
    }
}

fn client_from_persist(opt: ClientOpt) -> Result<ClientConfig, ErrorKind> {
    let group_id = GroupId::new(opt.group_id).map_err(|e| ErrorKind::ConfigError { reason: e.to_string() })?;
    let policy = HostPolicy::compile(opt.allowed_hosts, opt.forbidden_hosts)
        .map_err(policy_err_to_config_err)?;

    let handshake = HandshakeMeta {
        client_id: ClientId::generate(),
        group_id,
        username: opt.username,
        password: opt.password,
        group_password: (!opt.group_password.is_empty()).then_some(opt.group_password),
    };

    Ok(ClientConfig {
        gateway_addr: opt.gateway_addr,
        transport: opt.transport,
        handshake,
        policy,
        open_ports: opt.open_ports,
    })
}

fn policy_err_to_config_err(err: PolicyError) -> ErrorKind {
    ErrorKind::ConfigError { reason: err.to_string() }
}
