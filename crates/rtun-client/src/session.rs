//! Private Client session (component E): dials the Gateway, enters the main
//! CONNECT/DATA/CLOSE/PORT_ACCEPT/PORT_OPEN_ACK dispatch loop, and reconnects with
//! exponential jittered backoff whenever the transport dies.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rtun_core::context::AppContext;
use rtun_core::frame::Frame;
use rtun_core::metrics::{CloseReason, Direction, NoopObserver, SessionObserver};
use rtun_core::mux::Multiplexer;
use rtun_core::transport::{Connection, HandshakeMeta, Transport};
use rtun_core::types::{ConnId, OpenPortSpec, Protocol, TargetAddr};
use rtun_core::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};

use crate::policy::HostPolicy;

/// How long the client waits to dial a local target after a `CONNECT`/`PORT_ACCEPT`.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// How often the client sends an idle `PING`.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// How long without a single inbound frame before the transport is declared dead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Static identity and policy for one Private Client replica; shared across reconnects.
pub struct ClientSession<T: Transport> {
    transport: T,
    gateway_addr: String,
    handshake: HandshakeMeta,
    policy: HostPolicy,
    open_ports: Vec<OpenPortSpec>,
    ctx: AppContext,
    observer: Arc<dyn SessionObserver>,
}

impl<T: Transport> ClientSession<T> {
    pub fn new(
        transport: T,
        gateway_addr: String,
        handshake: HandshakeMeta,
        policy: HostPolicy,
        open_ports: Vec<OpenPortSpec>,
        ctx: AppContext,
    ) -> Self {
        Self::with_observer(transport, gateway_addr, handshake, policy, open_ports, ctx, Arc::new(NoopObserver))
    }

    /// Same as [`new`](Self::new) but lets the caller plug in a [`SessionObserver`]
    /// other than the default no-op.
    pub fn with_observer(
        transport: T,
        gateway_addr: String,
        handshake: HandshakeMeta,
        policy: HostPolicy,
        open_ports: Vec<OpenPortSpec>,
        ctx: AppContext,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self { transport, gateway_addr, handshake, policy, open_ports, ctx, observer }
    }

    /// Cancels the session's `AppContext`, causing [`run`](Self::run) to return once the
    /// current connection (if any) notices and the reconnect loop re-checks its flag.
    pub fn shutdown(&self) {
        self.ctx.shutdown();
    }

    /// Runs forever: dial, run the connection until it dies, back off, repeat. Returns
    /// once the session's `AppContext` is cancelled.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = INITIAL_BACKOFF;

        while !self.ctx.is_shutting_down() {
            match self.transport.dial(&self.gateway_addr, self.handshake.clone()).await {
                Ok(connection) => {
                    info!("client {} connected to {}", self.handshake.client_id, self.gateway_addr);
                    backoff = INITIAL_BACKOFF;
                    self.run_connection(connection).await;
                }
                Err(err) => {
                    warn!("client {} failed to dial {}: {err}", self.handshake.client_id, self.gateway_addr);
                }
            }

            if self.ctx.is_shutting_down() {
                break;
            }
            let jittered = backoff + Duration::from_secs_f64(backoff.as_secs_f64() * 0.3 * rand::random::<f64>());
            debug!("reconnecting in {jittered:?}");
            tokio::time::sleep(jittered).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn run_connection(&self, connection: T::Connection) {
        let connection = Arc::new(connection);
        let mux = Multiplexer::new();
        let port_acks: Mutex<HashMap<(u16, Protocol), oneshot::Sender<Result<(), String>>>> = Mutex::new(HashMap::new());

        for spec in &self.open_ports {
            let (tx, rx) = oneshot::channel();
            port_acks.lock().await.insert((spec.remote_port, spec.protocol), tx);
            let frame = Frame::PortOpen {
                remote_port: spec.remote_port,
                protocol: spec.protocol,
                local_host: spec.local_host.clone(),
                local_port: spec.local_port,
            };
            if let Err(err) = connection.write_message(frame).await {
                warn!("failed to request reverse port {}: {err}", spec.remote_port);
                continue;
            }
            let remote_port = spec.remote_port;
            tokio::spawn(async move {
                match rx.await {
                    Ok(Ok(())) => info!("reverse port {remote_port} opened"),
                    Ok(Err(reason)) => warn!("reverse port {remote_port} rejected: {reason}"),
                    Err(_) => {}
                }
            });
        }

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await; // first tick fires immediately; consume it
        let mut last_frame_at = Instant::now();

        let shutdown = self.ctx.token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("shutdown requested, closing tunnel connection");
                    break;
                }
                read = connection.read_message() => {
                    match read {
                        Ok(Some(frame)) => {
                            last_frame_at = Instant::now();
                            self.handle_frame(&connection, &mux, &port_acks, frame).await;
                        }
                        Ok(None) => {
                            debug!("gateway closed the connection");
                            break;
                        }
                        Err(err) => {
                            warn!("transport read error: {err}");
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if last_frame_at.elapsed() > IDLE_TIMEOUT {
                        warn!("no frame received in {:?}, declaring transport dead", last_frame_at.elapsed());
                        break;
                    }
                    let _ = connection.write_message(Frame::Ping).await;
                }
            }
        }

        let _ = connection.close().await;
    }

    async fn handle_frame(
        &self,
        connection: &Arc<T::Connection>,
        mux: &Multiplexer,
        port_acks: &Mutex<HashMap<(u16, Protocol), oneshot::Sender<Result<(), String>>>>,
        frame: Frame,
    ) {
        match frame {
            Frame::Connect { conn_id, protocol, target } => {
                self.handle_connect(connection, mux, conn_id, protocol, target).await;
            }
            Frame::Data { conn_id, payload } => {
                self.observer.on_bytes(conn_id, Direction::Inbound, payload.len());
                if let Err(err) = mux.deliver_data(&conn_id, payload).await {
                    warn!("dropping local connection {conn_id} after {err}");
                    let _ = connection.write_message(Frame::Close { conn_id, err_msg: Some(err.to_string()) }).await;
                    mux.remove(&conn_id).await;
                    self.observer.on_conn_close(conn_id, CloseReason::LocalClosed);
                }
            }
            Frame::Close { conn_id, .. } => {
                mux.mark_closing(&conn_id).await;
                mux.remove(&conn_id).await;
                self.observer.on_conn_close(conn_id, CloseReason::PeerClosed);
            }
            Frame::PortAccept { conn_id, remote_port, remote_peer_addr } => {
                self.handle_port_accept(connection, mux, conn_id, remote_port, remote_peer_addr).await;
            }
            Frame::PortOpenAck { remote_port, protocol, ok, err_msg } => {
                if let Some(tx) = port_acks.lock().await.remove(&(remote_port, protocol)) {
                    let _ = tx.send(if ok { Ok(()) } else { Err(err_msg.unwrap_or_default()) });
                }
            }
            Frame::Ping => {
                let _ = connection.write_message(Frame::Pong).await;
            }
            Frame::Pong => {}
            // Gateway-only inbound frames reaching a client means a misbehaving peer.
            Frame::ConnectAck { .. } | Frame::PortOpen { .. } => {
                warn!("client received a gateway-only frame");
            }
        }
    }

    async fn handle_connect(
        &self,
        connection: &Arc<T::Connection>,
        mux: &Multiplexer,
        conn_id: ConnId,
        protocol: Protocol,
        target: TargetAddr,
    ) {
        let resolved_ip = resolve(&target).await;
        if !self.policy.is_allowed(&target.host(), resolved_ip, target.port()) {
            let _ = connection
                .write_message(Frame::ConnectAck { conn_id, ok: false, err_msg: Some("forbidden".into()) })
                .await;
            return;
        }

        let socket = match protocol {
            Protocol::Tcp => tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((target.host(), target.port()))).await,
            Protocol::Udp => {
                let _ = connection
                    .write_message(Frame::ConnectAck { conn_id, ok: false, err_msg: Some("udp CONNECT is not supported".into()) })
                    .await;
                return;
            }
        };

        let socket = match socket {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => {
                let _ = connection
                    .write_message(Frame::ConnectAck { conn_id, ok: false, err_msg: Some(err.to_string()) })
                    .await;
                return;
            }
            Err(_elapsed) => {
                let _ = connection
                    .write_message(Frame::ConnectAck { conn_id, ok: false, err_msg: Some("connect timed out".into()) })
                    .await;
                return;
            }
        };

        let (virtual_conn, inbound_rx) = mux.accept(conn_id, target, protocol).await;
        if connection.write_message(Frame::ConnectAck { conn_id, ok: true, err_msg: None }).await.is_err() {
            mux.remove(&conn_id).await;
            return;
        }

        self.observer.on_conn_open(conn_id);
        spawn_pump(connection.clone(), conn_id, socket, virtual_conn, inbound_rx, self.observer.clone());
    }

    async fn handle_port_accept(
        &self,
        connection: &Arc<T::Connection>,
        mux: &Multiplexer,
        conn_id: ConnId,
        remote_port: u16,
        remote_peer_addr: std::net::SocketAddr,
    ) {
        let Some(spec) = self.open_ports.iter().find(|p| p.remote_port == remote_port) else {
            warn!("PORT_ACCEPT for unconfigured remote port {remote_port}");
            let _ = connection.write_message(Frame::Close { conn_id, err_msg: Some("unknown remote port".into()) }).await;
            return;
        };

        debug!("accepting forwarded connection from {remote_peer_addr} on port {remote_port}");
        let target = TargetAddr::Domain(spec.local_host.clone(), spec.local_port);
        let dial = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((spec.local_host.as_str(), spec.local_port))).await;
        let socket = match dial {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => {
                warn!("failed to dial local forward target for port {remote_port}: {err}");
                let _ = connection.write_message(Frame::Close { conn_id, err_msg: Some(err.to_string()) }).await;
                return;
            }
            Err(_elapsed) => {
                warn!("timed out dialing local forward target for port {remote_port}");
                let _ = connection.write_message(Frame::Close { conn_id, err_msg: Some("connect timed out".into()) }).await;
                return;
            }
        };

        let (virtual_conn, inbound_rx) = mux.accept(conn_id, target, spec.protocol).await;
        self.observer.on_conn_open(conn_id);
        spawn_pump(connection.clone(), conn_id, socket, virtual_conn, inbound_rx, self.observer.clone());
    }
}

fn spawn_pump<C: Connection>(
    connection: Arc<C>,
    conn_id: ConnId,
    socket: TcpStream,
    virtual_conn: Arc<rtun_core::mux::VirtualConn>,
    mut inbound_rx: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    observer: Arc<dyn SessionObserver>,
) {
    let (mut read_half, mut write_half) = socket.into_split();

    let upstream_conn = connection.clone();
    let upstream_observer = observer.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            upstream_observer.on_bytes(conn_id, Direction::Outbound, n);
            if upstream_conn.write_message(Frame::Data { conn_id, payload: Bytes::copy_from_slice(&buf[..n]) }).await.is_err() {
                break;
            }
        }
        let _ = upstream_conn.write_message(Frame::Close { conn_id, err_msg: None }).await;
        upstream_observer.on_conn_close(conn_id, CloseReason::LocalClosed);
    });

    tokio::spawn(async move {
        while let Some(payload) = inbound_rx.recv().await {
            let len = payload.len();
            if write_half.write_all(&payload).await.is_err() {
                break;
            }
            virtual_conn.release_inbound(len);
        }
    });
}

async fn resolve(target: &TargetAddr) -> Option<IpAddr> {
    match target {
        TargetAddr::IPv4(ip, _) => Some(IpAddr::V4(*ip)),
        TargetAddr::IPv6(ip, _) => Some(IpAddr::V6(*ip)),
        TargetAddr::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip()),
    }
}
