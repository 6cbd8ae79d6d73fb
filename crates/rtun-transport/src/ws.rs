//! WebSocket transport backend: one binary WebSocket frame per [`Frame`], handshake
//! identity carried as HTTP headers on the upgrade request, TLS terminated with
//! `rustls` on both ends.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::Uri;
use pin_project_lite::pin_project;
use rtun_core::frame::{decode_frame, encode_frame, Frame};
use rtun_core::transport::{Connection, HandshakeMeta, Listener, Transport};
use rtun_core::types::{ClientId, GroupId};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const HEADER_CLIENT_ID: &str = "x-rtun-client-id";
const HEADER_GROUP_ID: &str = "x-rtun-group-id";
const HEADER_USERNAME: &str = "x-rtun-username";
const HEADER_PASSWORD: &str = "x-rtun-password";
const HEADER_GROUP_PASSWORD: &str = "x-rtun-group-password";

pin_project! {
    /// Unifies the two concrete stream types `accept`/`dial` produce so both can share
    /// one [`Connection`] implementation.
    #[project = WsStreamProj]
    pub enum WsStream {
        Server { #[pin] inner: tokio_rustls::server::TlsStream<TcpStream> },
        Client { #[pin] inner: tokio_rustls::client::TlsStream<TcpStream> },
    }
}

impl AsyncRead for WsStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.project() {
            WsStreamProj::Server { inner } => inner.poll_read(cx, buf),
            WsStreamProj::Client { inner } => inner.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.project() {
            WsStreamProj::Server { inner } => inner.poll_write(cx, buf),
            WsStreamProj::Client { inner } => inner.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.project() {
            WsStreamProj::Server { inner } => inner.poll_flush(cx),
            WsStreamProj::Client { inner } => inner.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.project() {
            WsStreamProj::Server { inner } => inner.poll_shutdown(cx),
            WsStreamProj::Client { inner } => inner.poll_shutdown(cx),
        }
    }
}

fn ws_to_io(err: tokio_tungstenite::tungstenite::Error) -> std::io::Error {
    std::io::Error::other(err)
}

fn proto_to_io(err: rtun_core::frame::ProtoError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}

/// WebSocket `Connection`: one `WebSocketStream` and the `HandshakeMeta` it negotiated.
pub struct WsConnection {
    inner: AsyncMutex<WebSocketStream<WsStream>>,
    handshake: HandshakeMeta,
}

impl Connection for WsConnection {
    async fn write_message(&self, frame: Frame) -> std::io::Result<()> {
        let bytes = encode_frame(&frame);
        self.inner
            .lock()
            .await
            .send(Message::Binary(bytes.to_vec()))
            .await
            .map_err(ws_to_io)
    }

    async fn read_message(&self) -> std::io::Result<Option<Frame>> {
        let mut stream = self.inner.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return decode_frame(Bytes::from(data)).map(Some).map_err(proto_to_io);
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_ping_pong_or_text)) => continue,
                Some(Err(e)) => return Err(ws_to_io(e)),
            }
        }
    }

    async fn close(&self) -> std::io::Result<()> {
        self.inner.lock().await.close(None).await.map_err(ws_to_io)
    }

    fn handshake(&self) -> &HandshakeMeta {
        &self.handshake
    }
}

fn handshake_to_headers(request: &mut http::Request<()>, meta: &HandshakeMeta) {
    let headers = request.headers_mut();
    headers.insert(HEADER_CLIENT_ID, meta.client_id.as_str().parse().expect("ascii id"));
    headers.insert(HEADER_GROUP_ID, meta.group_id.as_str().parse().expect("ascii id"));
    headers.insert(HEADER_USERNAME, meta.username.parse().expect("ascii username"));
    headers.insert(HEADER_PASSWORD, meta.password.parse().expect("ascii password"));
    if let Some(group_password) = &meta.group_password {
        headers.insert(HEADER_GROUP_PASSWORD, group_password.parse().expect("ascii password"));
    }
}

fn headers_to_handshake(request: &WsRequest) -> Result<HandshakeMeta, String> {
    let get = |name: &str| -> Result<String, String> {
        request
            .headers()
            .get(name)
            .ok_or_else(|| format!("missing {name} header"))?
            .to_str()
            .map(str::to_owned)
            .map_err(|_| format!("{name} header is not valid ascii"))
    };
    Ok(HandshakeMeta {
        client_id: ClientId::new(get(HEADER_CLIENT_ID)?),
        group_id: GroupId::new(get(HEADER_GROUP_ID)?).map_err(|e| e.to_string())?,
        username: get(HEADER_USERNAME)?,
        password: get(HEADER_PASSWORD)?,
        group_password: request
            .headers()
            .get(HEADER_GROUP_PASSWORD)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
    })
}

/// WebSocket backend. `listen` terminates TLS with the configured `rustls::ServerConfig`;
/// `dial` trusts the platform's native roots via `rustls-platform-verifier`.
pub struct WsTransport {
    server_tls: Option<Arc<rustls::ServerConfig>>,
}

impl WsTransport {
    /// `server_tls` is only needed to `listen`; a Private Client that only ever `dial`s
    /// out can construct this with `None`.
    pub fn new(server_tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        Self { server_tls }
    }
}

pub struct WsListener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
}

impl Listener for WsListener {
    type Connection = WsConnection;

    async fn accept(&mut self) -> std::io::Result<Self::Connection> {
        let (tcp_stream, _peer) = self.tcp.accept().await?;
        let tls_stream = self.acceptor.accept(tcp_stream).await?;

        let captured: Arc<std::sync::Mutex<Option<HandshakeMeta>>> = Arc::new(std::sync::Mutex::new(None));
        let capture_for_callback = captured.clone();
        let callback = move |request: &WsRequest, response: WsResponse| match headers_to_handshake(request) {
            Ok(meta) => {
                *capture_for_callback.lock().unwrap() = Some(meta);
                Ok(response)
            }
            Err(reason) => {
                let mut error_response = ErrorResponse::new(Some(reason));
                *error_response.status_mut() = StatusCode::UNAUTHORIZED;
                Err(error_response)
            }
        };

        let ws_stream = tokio_tungstenite::accept_hdr_async(
            WsStream::Server { inner: tls_stream },
            callback,
        )
        .await
        .map_err(ws_to_io)?;

        let handshake = captured
            .lock()
            .unwrap()
            .take()
            .expect("callback runs and succeeds before accept_hdr_async resolves Ok");

        Ok(WsConnection { inner: AsyncMutex::new(ws_stream), handshake })
    }

    async fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Transport for WsTransport {
    type Connection = WsConnection;
    type Listener = WsListener;

    async fn listen(&self, addr: &str) -> std::io::Result<Self::Listener> {
        let server_tls = self
            .server_tls
            .clone()
            .ok_or_else(|| std::io::Error::other("WsTransport has no server TLS config to listen with"))?;
        let tcp = TcpListener::bind(addr).await?;
        Ok(WsListener { tcp, acceptor: TlsAcceptor::from(server_tls) })
    }

    async fn dial(&self, addr: &str, handshake: HandshakeMeta) -> std::io::Result<Self::Connection> {
        let uri: Uri = addr.parse().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let host = uri.host().ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing host"))?;
        let port = uri.port_u16().unwrap_or(443);
        let server_name = rustls::pki_types::ServerName::try_from(host.to_owned())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        let mut request = http::Request::builder()
            .uri(&uri)
            .body(())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        handshake_to_headers(&mut request, &handshake);

        let tcp_stream = TcpStream::connect((host, port)).await?;
        let client_config = {
            use rustls_platform_verifier::BuilderVerifierExt;
            rustls::ClientConfig::builder()
                .with_platform_verifier()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
                .with_no_client_auth()
        };
        let tls_stream = tokio_rustls::TlsConnector::from(Arc::new(client_config))
            .connect(server_name, tcp_stream)
            .await?;

        let (ws_stream, _response) =
            tokio_tungstenite::client_async(request, WsStream::Client { inner: tls_stream })
                .await
                .map_err(ws_to_io)?;

        Ok(WsConnection { inner: AsyncMutex::new(ws_stream), handshake })
    }
}
