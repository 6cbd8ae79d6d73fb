//! In-memory transport harness: a `Transport`/`Connection`/`Listener` triple backed by
//! `tokio::sync::mpsc` channel pairs instead of real sockets, so end-to-end scenario
//! tests don't need to bind ports. Grounded on `wind-test`'s own in-process SOCKS5
//! client/server harness, generalized to implement `rtun-core`'s transport traits.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rtun_core::frame::Frame;
use rtun_core::transport::{Connection, HandshakeMeta, Listener, Transport};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// One end of an in-memory tunnel connection.
pub struct LoopbackConnection {
    tx: mpsc::UnboundedSender<Frame>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Frame>>,
    handshake: HandshakeMeta,
    closed: AtomicBool,
}

impl Connection for LoopbackConnection {
    fn write_message(&self, frame: Frame) -> impl Future<Output = std::io::Result<()>> + Send {
        async move {
            self.tx.send(frame).map_err(|_| std::io::Error::other("loopback peer dropped"))
        }
    }

    fn read_message(&self) -> impl Future<Output = std::io::Result<Option<Frame>>> + Send {
        async move { Ok(self.rx.lock().await.recv().await) }
    }

    fn close(&self) -> impl Future<Output = std::io::Result<()>> + Send {
        async move {
            self.closed.store(true, Ordering::Release);
            Ok(())
        }
    }

    fn handshake(&self) -> &HandshakeMeta {
        &self.handshake
    }
}

/// A connected pair of [`LoopbackConnection`]s, as if a Private Client had dialed
/// straight into a Gateway's listener with no network in between.
pub fn connected_pair(handshake: HandshakeMeta) -> (LoopbackConnection, LoopbackConnection) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = LoopbackConnection {
        tx: a_tx,
        rx: AsyncMutex::new(a_rx),
        handshake: handshake.clone(),
        closed: AtomicBool::new(false),
    };
    let b = LoopbackConnection { tx: b_tx, rx: AsyncMutex::new(b_rx), handshake, closed: AtomicBool::new(false) };
    (a, b)
}

/// `Transport` whose `listen` hands out connections pushed onto it by a matching
/// `dial`, all in-process. One `LoopbackTransport` models one reachable Gateway
/// address; `dial`'s `addr` argument is ignored, since there's only ever one peer.
#[derive(Clone)]
pub struct LoopbackTransport {
    inbound_tx: mpsc::UnboundedSender<LoopbackConnection>,
    inbound_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<LoopbackConnection>>>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self { inbound_tx, inbound_rx: Arc::new(AsyncMutex::new(inbound_rx)) }
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(&self) -> LoopbackListener {
        LoopbackListener { inbound_rx: self.inbound_rx.clone() }
    }
}

pub struct LoopbackListener {
    inbound_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<LoopbackConnection>>>,
}

impl Listener for LoopbackListener {
    type Connection = LoopbackConnection;

    async fn accept(&mut self) -> std::io::Result<Self::Connection> {
        self.inbound_rx.lock().await.recv().await.ok_or_else(|| std::io::Error::other("loopback transport closed"))
    }

    async fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    type Connection = LoopbackConnection;
    type Listener = LoopbackListener;

    async fn listen(&self, _addr: &str) -> std::io::Result<Self::Listener> {
        Ok(self.listener())
    }

    async fn dial(&self, _addr: &str, handshake: HandshakeMeta) -> std::io::Result<Self::Connection> {
        let (client_side, gateway_side) = connected_pair(handshake);
        self.inbound_tx.send(gateway_side).map_err(|_| std::io::Error::other("no listener waiting"))?;
        Ok(client_side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtun_core::types::{ClientId, GroupId};

    fn handshake() -> HandshakeMeta {
        HandshakeMeta {
            client_id: ClientId::generate(),
            group_id: GroupId::new("default").unwrap(),
            username: "user".into(),
            password: "pass".into(),
            group_password: Some("group-secret".into()),
        }
    }

    #[tokio::test]
    async fn dial_delivers_a_connection_to_the_listener() {
        let transport = LoopbackTransport::new();
        let mut listener = transport.listener();

        let dial = tokio::spawn({
            let transport = transport.clone();
            async move { transport.dial("ignored", handshake()).await }
        });

        let gateway_side = listener.accept().await.unwrap();
        let client_side = dial.await.unwrap().unwrap();

        client_side.write_message(Frame::Ping).await.unwrap();
        assert!(matches!(gateway_side.read_message().await.unwrap(), Some(Frame::Ping)));
    }
}
