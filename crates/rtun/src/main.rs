use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser as _;
use rtun_client::ClientSession;
use rtun_core::context::AppContext;
use rtun_core::transport::{Listener, Transport};
use rtun_core::{error, info, warn};
use rtun_gateway::{serve_session, GatewaySession, GroupRouter};
use rtun_transport::grpc::GrpcTransport;
use rtun_transport::quic::{self, QuicTransport};
use rtun_transport::ws::WsTransport;
use tracing::Level;

use crate::cli::{Cli, Commands};
use crate::conf::persistent::{PersistentConfig, TransportKind};
use crate::conf::runtime::{ClientConfig, Config, GatewayConfig};
use crate::credentials::CredentialBackend;
use crate::tls::CertMaterial;

mod cli;
mod conf;
mod credentials;
mod log;
mod tls;

fn version_string() -> &'static str {
    match option_env!("RTUN_OVERRIDE_VERSION") {
        Some(v) => v,
        None => env!("CARGO_PKG_VERSION"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Must happen before any rustls::ServerConfig/ClientConfig is built.
    let _ = rustls::crypto::ring::default_provider().install_default();

    if let Err(err) = log::init_log(Level::INFO) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            println!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if cli.version {
        println!("rtun {}", version_string());
        return ExitCode::SUCCESS;
    }

    if let Some(Commands::Init { format, out }) = &cli.command {
        let format = match format {
            cli::ConfigFormat::Yaml => "yaml",
            cli::ConfigFormat::Toml => "toml",
        };
        return match PersistentConfig::default().export_to_file(out, format) {
            Ok(()) => {
                println!("wrote default configuration to {}", out.display());
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("failed to write configuration: {err}");
                ExitCode::FAILURE
            }
        };
    }

    let persistent = match PersistentConfig::load(cli.config.clone(), cli.config_dir.clone()) {
        Ok(persistent) => persistent,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::from_persist(persistent) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Some(Commands::Gateway) | None => run_gateway(config.gateway).await,
        Some(Commands::Client) => run_client(config.client).await,
        Some(Commands::Init { .. }) => unreachable!("handled above"),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Runs the public Gateway: binds the configured transport, accepts tunnel connections
/// from Private Clients until shutdown, then drains in-flight sessions within the
/// configured shutdown budget.
async fn run_gateway(config: GatewayConfig) -> eyre::Result<()> {
    let store = Arc::new(CredentialBackend::from_config(config.credentials.clone()).await?);
    let shutdown_timeout = config.shutdown_timeout;
    let listen_addr = config.listen_addr.to_string();

    let mut ctx = AppContext::new();

    match &config.transport {
        TransportKind::WebSocket => {
            let material = load_cert_material(&config)?;
            let transport = WsTransport::new(Some(Arc::new(material.rustls_server_config()?)));
            spawn_gateway_accept_loop(transport, &listen_addr, store, &mut ctx).await?;
        }
        TransportKind::Grpc => {
            let material = load_cert_material(&config)?;
            let identity = tonic::transport::Identity::from_pem(&material.cert_pem, &material.key_pem);
            let server_tls = tonic::transport::ServerTlsConfig::new().identity(identity);
            let transport = GrpcTransport::new(None, Some(server_tls));
            spawn_gateway_accept_loop(transport, &listen_addr, store, &mut ctx).await?;
        }
        TransportKind::Quic => {
            let material = load_cert_material(&config)?;
            let server_config = quinn::ServerConfig::with_single_cert(material.der_chain()?, material.der_key()?)?;
            let client_config = quic::platform_verified_client_config()?;
            let transport = QuicTransport::new(Some(server_config), client_config, "0.0.0.0:0".parse()?);
            spawn_gateway_accept_loop(transport, &listen_addr, store, &mut ctx).await?;
        }
    }

    wait_for_shutdown_signal().await;
    info!("shutting down, draining sessions (up to {shutdown_timeout:?})");
    ctx.shutdown();
    let _ = tokio::time::timeout(shutdown_timeout, ctx.join_all()).await;

    Ok(())
}

/// Binds `transport` and spawns the accept loop onto `ctx` so it is drained during
/// shutdown alongside every session it hands off to [`serve_session`].
async fn spawn_gateway_accept_loop<T: Transport>(
    transport: T,
    listen_addr: &str,
    store: Arc<CredentialBackend>,
    ctx: &mut AppContext,
) -> eyre::Result<()> {
    let router = Arc::new(GroupRouter::<GatewaySession<T::Connection>>::new());
    let mut listener = transport.listen(listen_addr).await?;
    info!("gateway listening on {listen_addr}");

    let shutdown = ctx.token();
    ctx.spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let connection = match accepted {
                        Ok(connection) => connection,
                        Err(err) => {
                            warn!("failed to accept tunnel connection: {err}");
                            continue;
                        }
                    };
                    let store = store.clone();
                    let router = router.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_session(connection, store, router).await {
                            warn!("tunnel session ended: {err}");
                        }
                    });
                }
            }
        }
        let _ = listener.close().await;
    });

    Ok(())
}

/// Runs a Private Client: dials the Gateway, serves proxy/port-forward traffic, and
/// reconnects with backoff until shutdown.
async fn run_client(config: ClientConfig) -> eyre::Result<()> {
    match &config.transport {
        TransportKind::WebSocket => run_client_with(WsTransport::new(None), config).await,
        TransportKind::Grpc => {
            let client_tls = tonic::transport::ClientTlsConfig::new().with_native_roots();
            run_client_with(GrpcTransport::new(Some(client_tls), None), config).await
        }
        TransportKind::Quic => {
            let client_config = quic::platform_verified_client_config()?;
            run_client_with(QuicTransport::new(None, client_config, "0.0.0.0:0".parse()?), config).await
        }
    }
}

async fn run_client_with<T: Transport>(transport: T, config: ClientConfig) -> eyre::Result<()> {
    let session = Arc::new(ClientSession::new(
        transport,
        config.gateway_addr,
        config.handshake,
        config.policy,
        config.open_ports,
        AppContext::new(),
    ));

    let run_handle = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    wait_for_shutdown_signal().await;
    info!("shutting down client");
    session.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(30), run_handle).await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn load_cert_material(config: &GatewayConfig) -> eyre::Result<CertMaterial> {
    let cert_path = config
        .tls_cert_path
        .as_deref()
        .ok_or_else(|| eyre::eyre!("gateway.tls_cert_path is required for the configured transport"))?;
    let key_path = config
        .tls_key_path
        .as_deref()
        .ok_or_else(|| eyre::eyre!("gateway.tls_key_path is required for the configured transport"))?;
    CertMaterial::load(cert_path, key_path)
}
