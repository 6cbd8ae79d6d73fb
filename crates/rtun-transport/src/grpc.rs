//! gRPC transport backend: one bidirectional `Stream` RPC per tunnel connection.
//! The first message on the stream carries the [`HandshakeMeta`]; every message after
//! that carries one encoded `Frame` as opaque bytes.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use rtun_core::frame::{decode_frame, encode_frame, Frame};
use rtun_core::transport::{Connection, HandshakeMeta, Listener, Transport};
use rtun_core::types::{ClientId, GroupId};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::StreamExt as _;
use tonic::transport::{Channel, ClientTlsConfig, Server, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};

pub mod proto {
    tonic::include_proto!("rtun.tunnel");
}

use proto::stream_message::Payload;
use proto::tunnel_client::TunnelClient;
use proto::tunnel_server::{Tunnel, TunnelServer};
use proto::{Handshake, StreamMessage};

fn io_err(err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(err.to_string())
}

fn handshake_to_proto(meta: &HandshakeMeta) -> Handshake {
    Handshake {
        client_id: meta.client_id.as_str().to_owned(),
        group_id: meta.group_id.as_str().to_owned(),
        username: meta.username.clone(),
        password: meta.password.clone(),
        group_password: meta.group_password.clone(),
    }
}

fn proto_to_handshake(h: Handshake) -> Result<HandshakeMeta, String> {
    Ok(HandshakeMeta {
        client_id: ClientId::new(h.client_id),
        group_id: GroupId::new(h.group_id).map_err(|e| e.to_string())?,
        username: h.username,
        password: h.password,
        group_password: h.group_password,
    })
}

/// Connection backed by one `Tunnel/Stream` RPC, symmetric for both the dialing client
/// and the accepting server.
pub struct GrpcConnection {
    outbound: mpsc::Sender<StreamMessage>,
    inbound: AsyncMutex<Streaming<StreamMessage>>,
    handshake: HandshakeMeta,
}

impl Connection for GrpcConnection {
    async fn write_message(&self, frame: Frame) -> std::io::Result<()> {
        let msg = StreamMessage { payload: Some(Payload::Frame(encode_frame(&frame).to_vec())) };
        self.outbound.send(msg).await.map_err(io_err)
    }

    async fn read_message(&self) -> std::io::Result<Option<Frame>> {
        let mut inbound = self.inbound.lock().await;
        loop {
            match inbound.message().await.map_err(io_err)? {
                None => return Ok(None),
                Some(StreamMessage { payload: Some(Payload::Frame(bytes)) }) => {
                    return decode_frame(Bytes::from(bytes))
                        .map(Some)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e));
                }
                // A stray second handshake message would be a protocol violation from a
                // well-behaved peer; skip rather than fail, the frame stream is still healthy.
                Some(StreamMessage { payload: Some(Payload::Handshake(_)) }) | Some(StreamMessage { payload: None }) => continue,
            }
        }
    }

    async fn close(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn handshake(&self) -> &HandshakeMeta {
        &self.handshake
    }
}

/// Dials a `Tunnel/Stream` RPC, sending the handshake as the first outbound message.
pub struct GrpcTransport {
    client_tls: Option<ClientTlsConfig>,
    server_tls: Option<ServerTlsConfig>,
}

impl GrpcTransport {
    pub fn new(client_tls: Option<ClientTlsConfig>, server_tls: Option<ServerTlsConfig>) -> Self {
        Self { client_tls, server_tls }
    }
}

pub struct GrpcListener {
    inbound: mpsc::Receiver<GrpcConnection>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Listener for GrpcListener {
    type Connection = GrpcConnection;

    async fn accept(&mut self) -> std::io::Result<Self::Connection> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| std::io::Error::other("grpc server task exited"))
    }

    async fn close(&mut self) -> std::io::Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        Ok(())
    }
}

struct TunnelService {
    accepted: mpsc::Sender<GrpcConnection>,
}

#[tonic::async_trait]
impl Tunnel for TunnelService {
    type StreamStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<StreamMessage, Status>> + Send + 'static>>;

    async fn stream(
        &self,
        request: Request<Streaming<StreamMessage>>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("stream closed before handshake"))?;
        let Some(Payload::Handshake(h)) = first.payload else {
            return Err(Status::invalid_argument("first message must be a handshake"));
        };
        let handshake = proto_to_handshake(h).map_err(Status::unauthenticated)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let conn = GrpcConnection { outbound: outbound_tx, inbound: AsyncMutex::new(inbound), handshake };

        self.accepted.send(conn).await.map_err(|_| Status::unavailable("gateway is shutting down"))?;

        let response_stream = ReceiverStream::new(outbound_rx).map(Ok);
        Ok(Response::new(Box::pin(response_stream)))
    }
}

impl Transport for GrpcTransport {
    type Connection = GrpcConnection;
    type Listener = GrpcListener;

    async fn listen(&self, addr: &str) -> std::io::Result<Self::Listener> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let tcp_listener = tokio::net::TcpListener::from_std(std_listener)?;

        let (accepted_tx, accepted_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let mut server = Server::builder();
        if let Some(tls) = self.server_tls.clone() {
            server = server.tls_config(tls).map_err(io_err)?;
        }
        let router = server.add_service(TunnelServer::new(TunnelService { accepted: accepted_tx }));

        tokio::spawn(async move {
            let incoming = TcpListenerStream::new(tcp_listener);
            let _ = router
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(GrpcListener { inbound: accepted_rx, shutdown: Some(shutdown_tx) })
    }

    async fn dial(&self, addr: &str, handshake: HandshakeMeta) -> std::io::Result<Self::Connection> {
        let mut endpoint = Channel::from_shared(addr.to_owned()).map_err(io_err)?;
        if let Some(tls) = self.client_tls.clone() {
            endpoint = endpoint.tls_config(tls).map_err(io_err)?;
        }
        let channel = endpoint.connect().await.map_err(io_err)?;
        let mut client = TunnelClient::new(channel);

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        outbound_tx
            .send(StreamMessage { payload: Some(Payload::Handshake(handshake_to_proto(&handshake))) })
            .await
            .map_err(io_err)?;

        let response = client.stream(ReceiverStream::new(outbound_rx)).await.map_err(io_err)?;
        let inbound = response.into_inner();

        Ok(GrpcConnection { outbound: outbound_tx, inbound: AsyncMutex::new(inbound), handshake })
    }
}
