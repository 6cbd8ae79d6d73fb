//! Transport abstraction (component A). Every backend (WebSocket, gRPC, QUIC — see the
//! `rtun-transport` crate) implements this trait pair; everything above this layer
//! (frame codec, multiplexer, sessions) is transport-agnostic.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::types::{ClientId, GroupId};

/// Identity and credentials carried by the handshake that establishes a tunnel
/// connection, regardless of which transport backend negotiated it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeMeta {
    pub client_id: ClientId,
    pub group_id: GroupId,
    pub username: String,
    pub password: String,
    pub group_password: Option<String>,
}

/// One established, authenticated tunnel connection between a Gateway and a Private
/// Client. A session multiplexes many [`VirtualConn`](crate::mux::VirtualConn)s over a
/// single `Connection`.
pub trait Connection: Send + Sync + 'static {
    fn write_message(&self, frame: Frame) -> impl Future<Output = std::io::Result<()>> + Send;

    fn read_message(&self) -> impl Future<Output = std::io::Result<Option<Frame>>> + Send;

    fn close(&self) -> impl Future<Output = std::io::Result<()>> + Send;

    fn handshake(&self) -> &HandshakeMeta;
}

/// A transport backend: something that can listen for inbound tunnel connections (the
/// Gateway side) or dial out to establish one (the Private Client side).
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;
    type Listener: Listener<Connection = Self::Connection>;

    fn listen(&self, addr: &str) -> impl Future<Output = std::io::Result<Self::Listener>> + Send;

    fn dial(
        &self,
        addr: &str,
        handshake: HandshakeMeta,
    ) -> impl Future<Output = std::io::Result<Self::Connection>> + Send;
}

/// The accept side of a [`Transport`], yielding one `Connection` per accepted Private
/// Client.
pub trait Listener: Send + 'static {
    type Connection: Connection;

    fn accept(&mut self) -> impl Future<Output = std::io::Result<Self::Connection>> + Send;

    fn close(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;
}
