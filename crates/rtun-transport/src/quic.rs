//! QUIC transport backend. One bidirectional stream per tunnel connection; since raw
//! QUIC streams don't delimit messages, frames are length-prefixed with
//! [`crate::framing`]. The handshake is the first message sent on the stream,
//! JSON-encoded (this is the only backend where `HandshakeMeta` travels inline with the
//! data rather than in transport-native metadata).

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rtun_core::frame::{decode_frame, encode_frame, Frame};
use rtun_core::transport::{Connection, HandshakeMeta, Listener, Transport};
use tokio::sync::Mutex as AsyncMutex;

use crate::framing;

fn io_err(err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(err.to_string())
}

fn proto_to_io(err: rtun_core::frame::ProtoError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, err)
}

pub struct QuicConnection {
    send: AsyncMutex<quinn::SendStream>,
    recv: AsyncMutex<quinn::RecvStream>,
    handshake: HandshakeMeta,
    // Kept alive for the lifetime of the connection: dropping it closes the stream pair.
    _connection: quinn::Connection,
}

impl Connection for QuicConnection {
    async fn write_message(&self, frame: Frame) -> std::io::Result<()> {
        let bytes = encode_frame(&frame);
        framing::write_framed(&mut *self.send.lock().await, &bytes).await
    }

    async fn read_message(&self) -> std::io::Result<Option<Frame>> {
        let mut recv = self.recv.lock().await;
        match framing::read_framed(&mut *recv).await? {
            None => Ok(None),
            Some(bytes) => decode_frame(Bytes::from(bytes)).map(Some).map_err(proto_to_io),
        }
    }

    async fn close(&self) -> std::io::Result<()> {
        self.send.lock().await.finish().map_err(io_err)
    }

    fn handshake(&self) -> &HandshakeMeta {
        &self.handshake
    }
}

async fn open_handshake_stream(
    connection: &quinn::Connection,
    handshake: HandshakeMeta,
) -> std::io::Result<(quinn::SendStream, quinn::RecvStream)> {
    let (mut send, recv) = connection.open_bi().await.map_err(io_err)?;
    let body = serde_json::to_vec(&handshake).expect("HandshakeMeta always serializes");
    framing::write_framed(&mut send, &body).await?;
    Ok((send, recv))
}

async fn accept_handshake_stream(
    connection: &quinn::Connection,
) -> std::io::Result<(quinn::SendStream, quinn::RecvStream, HandshakeMeta)> {
    let (send, mut recv) = connection.accept_bi().await.map_err(io_err)?;
    let body = framing::read_framed(&mut recv)
        .await?
        .ok_or_else(|| std::io::Error::other("peer closed before sending a handshake"))?;
    let handshake: HandshakeMeta =
        serde_json::from_slice(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok((send, recv, handshake))
}

/// QUIC backend. `listen` needs a `quinn::ServerConfig` (certificate + ALPN); `dial`
/// needs a `quinn::ClientConfig` (trust roots, typically via `rustls-platform-verifier`).
pub struct QuicTransport {
    server_config: Option<quinn::ServerConfig>,
    client_config: quinn::ClientConfig,
    client_bind_addr: SocketAddr,
}

impl QuicTransport {
    pub fn new(
        server_config: Option<quinn::ServerConfig>,
        client_config: quinn::ClientConfig,
        client_bind_addr: SocketAddr,
    ) -> Self {
        Self { server_config, client_config, client_bind_addr }
    }
}

pub struct QuicListener {
    endpoint: quinn::Endpoint,
}

impl Listener for QuicListener {
    type Connection = QuicConnection;

    async fn accept(&mut self) -> std::io::Result<Self::Connection> {
        loop {
            let incoming = self.endpoint.accept().await.ok_or_else(|| std::io::Error::other("quic endpoint closed"))?;
            let connection = incoming.await.map_err(io_err)?;
            match accept_handshake_stream(&connection).await {
                Ok((send, recv, handshake)) => {
                    return Ok(QuicConnection {
                        send: AsyncMutex::new(send),
                        recv: AsyncMutex::new(recv),
                        handshake,
                        _connection: connection,
                    });
                }
                // A connection that never completes the handshake stream shouldn't take
                // down the whole listener; move on to the next inbound connection.
                Err(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.endpoint.close(0u32.into(), b"shutdown");
        Ok(())
    }
}

impl Transport for QuicTransport {
    type Connection = QuicConnection;
    type Listener = QuicListener;

    async fn listen(&self, addr: &str) -> std::io::Result<Self::Listener> {
        let server_config = self
            .server_config
            .clone()
            .ok_or_else(|| std::io::Error::other("QuicTransport has no server_config configured"))?;
        let socket_addr: SocketAddr = addr.parse().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let endpoint = quinn::Endpoint::server(server_config, socket_addr)?;
        Ok(QuicListener { endpoint })
    }

    async fn dial(&self, addr: &str, handshake: HandshakeMeta) -> std::io::Result<Self::Connection> {
        let socket_addr: SocketAddr = addr.parse().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let server_name = match socket_addr {
            SocketAddr::V4(_) => socket_addr.ip().to_string(),
            SocketAddr::V6(_) => socket_addr.ip().to_string(),
        };

        let mut endpoint = quinn::Endpoint::client(self.client_bind_addr)?;
        endpoint.set_default_client_config(self.client_config.clone());

        let connection = endpoint.connect(socket_addr, &server_name).map_err(io_err)?.await.map_err(io_err)?;
        let (send, recv) = open_handshake_stream(&connection, handshake.clone()).await?;

        Ok(QuicConnection { send: AsyncMutex::new(send), recv: AsyncMutex::new(recv), handshake, _connection: connection })
    }
}

/// Builds a `quinn::ClientConfig` that trusts the platform's native certificate roots,
/// matching the verification policy `rtun-transport::ws` uses for its own TLS dials.
pub fn platform_verified_client_config() -> eyre::Result<quinn::ClientConfig> {
    let crypto = {
        use rustls_platform_verifier::BuilderVerifierExt;
        rustls::ClientConfig::builder().with_platform_verifier()?.with_no_client_auth()
    };
    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?;
    Ok(quinn::ClientConfig::new(Arc::new(quic_crypto)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_verified_client_config_builds() {
        assert!(platform_verified_client_config().is_ok());
    }
}
