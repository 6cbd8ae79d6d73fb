//! Gateway session (component F): owns one tunnel `Connection` to a Private Client,
//! its Multiplexer, and the reverse listeners opened on its behalf.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rtun_core::credentials::CredentialStore;
use rtun_core::error::ErrorKind;
use rtun_core::frame::Frame;
use rtun_core::metrics::{CloseReason, Direction, NoopObserver, SessionObserver};
use rtun_core::{debug, info, warn};
use rtun_core::mux::Multiplexer;
use rtun_core::transport::Connection;
use rtun_core::types::{ClientId, ConnId, GroupId, Protocol, TargetAddr};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::portfwd::ReversePortForwarder;
use crate::router::DispatchTarget;

/// One authenticated tunnel connection from a Private Client, seen from the Gateway.
pub struct GatewaySession<C: Connection> {
    client_id: ClientId,
    group_id: GroupId,
    connection: Arc<C>,
    mux: Multiplexer,
    ports: ReversePortForwarder,
    alive: AtomicBool,
    observer: Arc<dyn SessionObserver>,
}

impl<C: Connection> DispatchTarget for GatewaySession<C> {
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Validates the handshake's group credentials against `store`, per `spec.md` §4.F
/// step 1: an unregistered group with a non-empty `group_password` self-provisions on
/// first contact; a registered group must match; a group with no stored password and no
/// `group_password` supplied is rejected.
pub async fn authenticate<S: CredentialStore>(
    store: &S,
    group_id: &GroupId,
    group_password: &Option<String>,
) -> Result<(), ErrorKind> {
    let registered = store.exists(group_id).await.unwrap_or(false);
    match (registered, group_password.as_deref()) {
        (true, Some(pw)) => {
            if store.validate(group_id, pw).await.unwrap_or(false) {
                Ok(())
            } else {
                Err(ErrorKind::AuthFailed { group_id: group_id.to_string() })
            }
        }
        (true, None) => Err(ErrorKind::AuthFailed { group_id: group_id.to_string() }),
        (false, Some(pw)) if !pw.is_empty() => {
            store
                .register(group_id.clone(), pw)
                .await
                .map_err(|_| ErrorKind::AuthFailed { group_id: group_id.to_string() })
        }
        _ => Err(ErrorKind::AuthFailed { group_id: group_id.to_string() }),
    }
}

impl<C: Connection> GatewaySession<C> {
    /// Completes steps 1–2 of `spec.md` §4.F and returns a session ready to be run and
    /// registered into the `GroupRouter`.
    pub async fn handshake<S: CredentialStore>(
        connection: C,
        store: &S,
    ) -> Result<Self, ErrorKind> {
        Self::handshake_with_observer(connection, store, Arc::new(NoopObserver)).await
    }

    /// Same as [`handshake`](Self::handshake) but lets the caller plug in a
    /// [`SessionObserver`] other than the default no-op.
    pub async fn handshake_with_observer<S: CredentialStore>(
        connection: C,
        store: &S,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self, ErrorKind> {
        let meta = connection.handshake().clone();
        authenticate(store, &meta.group_id, &meta.group_password).await?;

        Ok(Self {
            client_id: meta.client_id,
            group_id: meta.group_id,
            connection: Arc::new(connection),
            mux: Multiplexer::new(),
            ports: ReversePortForwarder::new(),
            alive: AtomicBool::new(true),
            observer,
        })
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Opens a new virtual connection toward the client for an externally-dialed proxy
    /// request (`spec.md` §4.G steps 4–5): sends `CONNECT` and waits for the ack.
    pub async fn dispatch_connect(
        &self,
        target: TargetAddr,
        protocol: Protocol,
    ) -> Result<(ConnId, Arc<rtun_core::mux::VirtualConn>, mpsc::UnboundedReceiver<Bytes>), ErrorKind> {
        let conn_id = Uuid::new_v4();
        let opened = self.mux.open(conn_id, target.clone(), protocol).await;

        self.connection
            .write_message(Frame::Connect { conn_id, protocol, target })
            .await
            .map_err(|e| ErrorKind::TransportDead { reason: e.to_string() })?;

        let (conn, rx) = opened.wait_for_ack(&self.mux).await?;
        self.observer.on_conn_open(conn_id);
        Ok((conn_id, conn, rx))
    }

    /// Registers a connection accepted on a reverse-forwarded port and announces it to
    /// the client with `PORT_ACCEPT` (`spec.md` §4.H). No ack is expected: the client
    /// starts piping `DATA` as soon as it dials the declared local target.
    pub async fn accept_port_connection(
        &self,
        remote_port: u16,
        remote_peer_addr: std::net::SocketAddr,
        target: TargetAddr,
        protocol: Protocol,
    ) -> Result<(ConnId, Arc<rtun_core::mux::VirtualConn>, mpsc::UnboundedReceiver<Bytes>), ErrorKind> {
        let conn_id = Uuid::new_v4();
        let (conn, rx) = self.mux.accept(conn_id, target, protocol).await;
        self.connection
            .write_message(Frame::PortAccept { conn_id, remote_port, remote_peer_addr })
            .await
            .map_err(|e| ErrorKind::TransportDead { reason: e.to_string() })?;
        self.observer.on_conn_open(conn_id);
        Ok((conn_id, conn, rx))
    }

    pub async fn send_data(&self, conn_id: ConnId, payload: Bytes) -> Result<(), ErrorKind> {
        self.observer.on_bytes(conn_id, Direction::Outbound, payload.len());
        self.connection
            .write_message(Frame::Data { conn_id, payload })
            .await
            .map_err(|e| ErrorKind::TransportDead { reason: e.to_string() })
    }

    /// Writes a frame directly, bypassing the multiplexer. Used for frames with no
    /// associated `conn_id`, such as `PORT_OPEN_ACK`.
    pub async fn connection_write(&self, frame: Frame) -> std::io::Result<()> {
        self.connection.write_message(frame).await
    }

    pub async fn send_close(&self, conn_id: ConnId, err_msg: Option<String>) {
        let _ = self.connection.write_message(Frame::Close { conn_id, err_msg }).await;
        self.mux.remove(&conn_id).await;
        self.observer.on_conn_close(conn_id, CloseReason::LocalClosed);
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn ports(&self) -> &ReversePortForwarder {
        &self.ports
    }

    /// Runs the inbound read loop (`spec.md` §4.F step 3) until the transport dies,
    /// then tears the session down (step 4).
    pub async fn run(self: &Arc<Self>) {
        loop {
            match self.connection.read_message().await {
                Ok(Some(frame)) => self.handle_frame(frame).await,
                Ok(None) => {
                    debug!("gateway session for {} closed by peer", self.client_id);
                    break;
                }
                Err(err) => {
                    warn!("gateway session for {} transport error: {err}", self.client_id);
                    break;
                }
            }
        }
        self.teardown().await;
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::ConnectAck { conn_id, ok, err_msg } => {
                self.mux.deliver_ack(&conn_id, if ok { Ok(()) } else { Err(err_msg.unwrap_or_default()) }).await;
            }
            Frame::Data { conn_id, payload } => {
                self.observer.on_bytes(conn_id, Direction::Inbound, payload.len());
                if let Err(err) = self.mux.deliver_data(&conn_id, payload).await {
                    warn!("dropping connection {conn_id} after {err}");
                    self.send_close(conn_id, Some(err.to_string())).await;
                }
            }
            Frame::Close { conn_id, .. } => {
                self.mux.mark_closing(&conn_id).await;
                self.mux.remove(&conn_id).await;
                self.observer.on_conn_close(conn_id, CloseReason::PeerClosed);
            }
            Frame::PortOpen { remote_port, protocol, local_host, local_port } => {
                self.ports.clone().handle_port_open(self.clone(), remote_port, protocol, local_host, local_port).await;
            }
            Frame::Ping => {
                let _ = self.connection.write_message(Frame::Pong).await;
            }
            Frame::Pong => {}
            // Client-only inbound frames (CONNECT, PORT_ACCEPT, PORT_OPEN_ACK) reaching
            // a Gateway means a misbehaving peer; ignore rather than kill the session.
            Frame::Connect { .. } | Frame::PortAccept { .. } | Frame::PortOpenAck { .. } => {
                warn!("gateway session for {} received a client-only frame", self.client_id);
            }
        }
    }

    async fn teardown(&self) {
        self.alive.store(false, Ordering::Release);
        self.ports.close_all().await;
        self.mux.close_all().await;
        info!("gateway session for {} ({}) torn down", self.client_id, self.group_id);
    }
}
