//! Reverse port forwarder (component H): binds a public listener on behalf of a
//! `PORT_OPEN` request and turns each inbound peer into a virtual connection announced
//! to the client with `PORT_ACCEPT`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rtun_core::frame::Frame;
use rtun_core::transport::Connection;
use rtun_core::warn;
use rtun_core::types::{ConnId, Protocol, TargetAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::session::GatewaySession;

/// How long a UDP peer mapping survives without traffic in either direction before it
/// is torn down, per `spec.md` §4.H.
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Socket read chunk size for the TCP and UDP pump loops.
const PUMP_CHUNK: usize = 16 * 1024;

struct BoundPort {
    accept_task: JoinHandle<()>,
}

/// Registry of reverse listeners a single `GatewaySession` owns. Cheaply `Clone`-able:
/// every clone shares the same underlying port table, so the listener accept loops
/// (which hold a clone) can be spawned independently of the session's read loop.
#[derive(Clone, Default)]
pub struct ReversePortForwarder {
    bound: Arc<Mutex<HashMap<(u16, Protocol), BoundPort>>>,
}

impl ReversePortForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles an inbound `PORT_OPEN` (`spec.md` §4.H): rejects a port/protocol pair
    /// already bound, otherwise binds a public listener and acks success.
    pub async fn handle_port_open<C: Connection>(
        self,
        session: Arc<GatewaySession<C>>,
        remote_port: u16,
        protocol: Protocol,
        local_host: String,
        local_port: u16,
    ) {
        let key = (remote_port, protocol);
        {
            let bound = self.bound.lock().await;
            if bound.contains_key(&key) {
                ack(&session, remote_port, protocol, false, Some("port already bound".into())).await;
                return;
            }
        }

        let target = TargetAddr::Domain(local_host, local_port);
        let bind_result = match protocol {
            Protocol::Tcp => bind_tcp(session.clone(), remote_port, protocol, target).await,
            Protocol::Udp => bind_udp(session.clone(), remote_port, protocol, target).await,
        };

        match bind_result {
            Ok(task) => {
                self.bound.lock().await.insert(key, BoundPort { accept_task: task });
                ack(&session, remote_port, protocol, true, None).await;
            }
            Err(err) => {
                ack(&session, remote_port, protocol, false, Some(err)).await;
            }
        }
    }

    /// Closes every listener this forwarder owns, synchronously with respect to the
    /// caller, so the port can be rebound by a later session (`spec.md` §4.H).
    pub async fn close_all(&self) {
        let mut bound = self.bound.lock().await;
        for (_, port) in bound.drain() {
            port.accept_task.abort();
        }
    }
}

async fn ack<C: Connection>(
    session: &Arc<GatewaySession<C>>,
    remote_port: u16,
    protocol: Protocol,
    ok: bool,
    err_msg: Option<String>,
) {
    let _ = session.connection_write(Frame::PortOpenAck { remote_port, protocol, ok, err_msg }).await;
}

async fn bind_tcp<C: Connection>(
    session: Arc<GatewaySession<C>>,
    remote_port: u16,
    protocol: Protocol,
    target: TargetAddr,
) -> Result<JoinHandle<()>, String> {
    let listener = TcpListener::bind(("0.0.0.0", remote_port)).await.map_err(|e| e.to_string())?;
    let task = tokio::spawn(async move {
        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("reverse tcp listener on {remote_port} stopped accepting: {err}");
                    break;
                }
            };
            let session = session.clone();
            let target = target.clone();
            tokio::spawn(pump_tcp_connection(session, socket, remote_port, peer_addr, target, protocol));
        }
    });
    Ok(task)
}

async fn pump_tcp_connection<C: Connection>(
    session: Arc<GatewaySession<C>>,
    socket: TcpStream,
    remote_port: u16,
    peer_addr: SocketAddr,
    target: TargetAddr,
    protocol: Protocol,
) {
    let (conn_id, virtual_conn, inbound_rx) =
        match session.accept_port_connection(remote_port, peer_addr, target, protocol).await {
            Ok(triple) => triple,
            Err(err) => {
                warn!("failed to register reverse port connection from {peer_addr}: {err}");
                return;
            }
        };

    let (read_half, write_half) = socket.into_split();
    let upstream = tokio::spawn(pump_socket_to_session(session.clone(), conn_id, read_half));
    let downstream = tokio::spawn(pump_session_to_socket(virtual_conn, inbound_rx, write_half));

    let _ = tokio::join!(upstream, downstream);
    session.send_close(conn_id, None).await;
}

async fn pump_socket_to_session<C: Connection>(
    session: Arc<GatewaySession<C>>,
    conn_id: ConnId,
    mut reader: tokio::net::tcp::OwnedReadHalf,
) {
    let mut buf = vec![0u8; PUMP_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if session.send_data(conn_id, Bytes::copy_from_slice(&buf[..n])).await.is_err() {
            break;
        }
    }
}

async fn pump_session_to_socket(
    virtual_conn: Arc<rtun_core::mux::VirtualConn>,
    mut inbound_rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
) {
    while let Some(payload) = inbound_rx.recv().await {
        let len = payload.len();
        if writer.write_all(&payload).await.is_err() {
            break;
        }
        virtual_conn.release_inbound(len);
    }
}

async fn bind_udp<C: Connection>(
    session: Arc<GatewaySession<C>>,
    remote_port: u16,
    protocol: Protocol,
    target: TargetAddr,
) -> Result<JoinHandle<()>, String> {
    let socket = Arc::new(UdpSocket::bind(("0.0.0.0", remote_port)).await.map_err(|e| e.to_string())?);
    let task = tokio::spawn(udp_datagram_loop(session, socket, remote_port, protocol, target));
    Ok(task)
}

struct UdpPeer {
    conn_id: ConnId,
    last_seen: Instant,
}

async fn udp_datagram_loop<C: Connection>(
    session: Arc<GatewaySession<C>>,
    socket: Arc<UdpSocket>,
    remote_port: u16,
    protocol: Protocol,
    target: TargetAddr,
) {
    let mut peers: HashMap<SocketAddr, UdpPeer> = HashMap::new();
    let mut sweep = tokio::time::interval(Duration::from_secs(10));
    let mut buf = vec![0u8; PUMP_CHUNK];

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                let (len, peer_addr) = match recv {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("reverse udp socket on {remote_port} failed: {err}");
                        break;
                    }
                };
                let payload = Bytes::copy_from_slice(&buf[..len]);

                let conn_id = match peers.get_mut(&peer_addr) {
                    Some(peer) => {
                        peer.last_seen = Instant::now();
                        peer.conn_id
                    }
                    None => {
                        let (conn_id, virtual_conn, inbound_rx) =
                            match session.accept_port_connection(remote_port, peer_addr, target.clone(), protocol).await {
                                Ok(triple) => triple,
                                Err(err) => {
                                    warn!("failed to register reverse udp peer {peer_addr}: {err}");
                                    continue;
                                }
                            };
                        peers.insert(peer_addr, UdpPeer { conn_id, last_seen: Instant::now() });
                        tokio::spawn(udp_return_pump(socket.clone(), peer_addr, virtual_conn, inbound_rx));
                        conn_id
                    }
                };

                if let Err(err) = session.send_data(conn_id, payload).await {
                    warn!("reverse udp peer {peer_addr} send failed: {err}");
                    peers.remove(&peer_addr);
                }
            }
            _ = sweep.tick() => {
                let stale: Vec<SocketAddr> = peers
                    .iter()
                    .filter(|(_, peer)| peer.last_seen.elapsed() > UDP_IDLE_TIMEOUT)
                    .map(|(addr, _)| *addr)
                    .collect();
                for addr in stale {
                    if let Some(peer) = peers.remove(&addr) {
                        session.send_close(peer.conn_id, Some("udp peer idle timeout".into())).await;
                    }
                }
            }
        }
    }
}

/// Relays `DATA` frames arriving from the client back out to the original UDP peer.
async fn udp_return_pump(
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    virtual_conn: Arc<rtun_core::mux::VirtualConn>,
    mut inbound_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(payload) = inbound_rx.recv().await {
        let len = payload.len();
        if socket.send_to(&payload, peer_addr).await.is_err() {
            break;
        }
        virtual_conn.release_inbound(len);
    }
}
