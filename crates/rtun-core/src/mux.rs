//! Virtual connection multiplexer (component C). Demultiplexes the many logical
//! connections carried by one tunnel `Connection` into per-`conn_id` state, enforcing
//! the OPENING -> OPEN -> CLOSING -> CLOSED lifecycle, the bounded inbound buffer, and
//! the connect-ack and backpressure timeouts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock, Semaphore};
use tokio::time::timeout;

use crate::error::ErrorKind;
use crate::types::{ConnId, Protocol, TargetAddr};

/// Bytes buffered for one virtual connection before the sender is made to wait.
pub const INBOUND_BUFFER_CAPACITY: u32 = 64 * 1024;
/// How long a sender waits for inbound buffer space before the connection is killed.
pub const BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long the opener of a virtual connection waits for a `CONNECT_ACK`.
pub const CONNECT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnState {
    Opening = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for ConnState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnState::Opening,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// One logical connection multiplexed over a tunnel. Holds the bounded inbound buffer
/// (bytes arriving from the peer, waiting to be written to the local socket) and the
/// connect-ack rendezvous; the outbound direction (local socket -> peer `DATA` frames)
/// has no buffer here, since the transport's own write backpressure throttles it.
#[derive(Debug)]
pub struct VirtualConn {
    id: ConnId,
    target: TargetAddr,
    protocol: Protocol,
    state: AtomicU8,
    backpressure: Semaphore,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    ack: Mutex<Option<oneshot::Sender<Result<(), String>>>>,
}

impl VirtualConn {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Pushes one `DATA` frame's payload into the inbound buffer, waiting up to
    /// [`BACKPRESSURE_TIMEOUT`] for room. The caller must release an equal number of
    /// bytes via [`release_inbound`](Self::release_inbound) once the consumer has
    /// drained them to the local socket.
    pub async fn push_inbound(&self, payload: Bytes) -> Result<(), ErrorKind> {
        let permits = payload.len().min(u32::MAX as usize) as u32;
        let permit = timeout(BACKPRESSURE_TIMEOUT, self.backpressure.acquire_many(permits))
            .await
            .map_err(|_| ErrorKind::BackpressureTimeout { conn_id: self.id })?
            .expect("inbound backpressure semaphore is never closed while a conn is live");
        permit.forget();
        match self.inbound_tx.lock().await.as_ref() {
            Some(tx) => tx
                .send(payload)
                .map_err(|_| ErrorKind::TransportDead { reason: "inbound consumer dropped".into() }),
            None => Err(ErrorKind::TransportDead { reason: "connection already closed".into() }),
        }
    }

    /// Returns buffer capacity after the consumer has written `len` bytes out.
    pub fn release_inbound(&self, len: usize) {
        self.backpressure.add_permits(len);
    }

    /// Resolves the pending `CONNECT`'s ack future. A second call (e.g. a duplicate
    /// ack, or an ack racing a local timeout) is a no-op.
    async fn resolve_ack(&self, result: Result<(), String>) {
        if let Some(tx) = self.ack.lock().await.take() {
            let _ = tx.send(result);
        }
    }

    /// Marks the connection `Closed` and drops its `inbound_tx` so any task parked on
    /// the paired `inbound_rx.recv()` observes EOF immediately, regardless of how many
    /// other `Arc<VirtualConn>` clones (e.g. an in-flight pump task) are still alive.
    pub async fn close(&self) {
        self.set_state(ConnState::Closed);
        self.inbound_tx.lock().await.take();
    }
}

/// Handle returned by [`Multiplexer::open`]: the registered connection plus its
/// inbound byte stream and connect-ack future.
pub struct OpenedConn {
    pub conn: Arc<VirtualConn>,
    pub inbound_rx: mpsc::UnboundedReceiver<Bytes>,
    ack_rx: oneshot::Receiver<Result<(), String>>,
}

impl OpenedConn {
    /// Waits up to [`CONNECT_ACK_TIMEOUT`] for the peer's `CONNECT_ACK`. On success the
    /// connection is already `Open`; on failure or timeout it has been removed from the
    /// multiplexer.
    pub async fn wait_for_ack(self, mux: &Multiplexer) -> Result<(Arc<VirtualConn>, mpsc::UnboundedReceiver<Bytes>), ErrorKind> {
        let id = self.conn.id();
        let outcome = timeout(CONNECT_ACK_TIMEOUT, self.ack_rx).await;
        match outcome {
            Ok(Ok(Ok(()))) => {
                self.conn.set_state(ConnState::Open);
                Ok((self.conn, self.inbound_rx))
            }
            Ok(Ok(Err(reason))) => {
                mux.remove(&id).await;
                Err(ErrorKind::UpstreamRefused { reason })
            }
            Ok(Err(_recv_dropped)) => {
                mux.remove(&id).await;
                Err(ErrorKind::TransportDead { reason: "connection closed before ack".into() })
            }
            Err(_elapsed) => {
                mux.remove(&id).await;
                Err(ErrorKind::UpstreamRefused { reason: "connect-ack timed out".into() })
            }
        }
    }
}

/// Registry of every `VirtualConn` live on one tunnel connection.
#[derive(Default)]
pub struct Multiplexer {
    conns: RwLock<HashMap<ConnId, Arc<VirtualConn>>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new virtual connection in the `Opening` state.
    pub async fn open(&self, id: ConnId, target: TargetAddr, protocol: Protocol) -> OpenedConn {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let conn = Arc::new(VirtualConn {
            id,
            target,
            protocol,
            state: AtomicU8::new(ConnState::Opening as u8),
            backpressure: Semaphore::new(INBOUND_BUFFER_CAPACITY as usize),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            ack: Mutex::new(Some(ack_tx)),
        });
        self.conns.write().await.insert(id, conn.clone());
        OpenedConn { conn, inbound_rx, ack_rx }
    }

    /// Registers a connection the *peer* asked to open (we are answering a `CONNECT`,
    /// not sending one), already past the ack rendezvous.
    pub async fn accept(&self, id: ConnId, target: TargetAddr, protocol: Protocol) -> (Arc<VirtualConn>, mpsc::UnboundedReceiver<Bytes>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(VirtualConn {
            id,
            target,
            protocol,
            state: AtomicU8::new(ConnState::Open as u8),
            backpressure: Semaphore::new(INBOUND_BUFFER_CAPACITY as usize),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            ack: Mutex::new(None),
        });
        self.conns.write().await.insert(id, conn.clone());
        (conn, inbound_rx)
    }

    pub async fn get(&self, id: &ConnId) -> Option<Arc<VirtualConn>> {
        self.conns.read().await.get(id).cloned()
    }

    /// Delivers a `CONNECT_ACK` to whichever task is waiting in
    /// [`OpenedConn::wait_for_ack`] for `id`. No-op if `id` is unknown or already acked.
    pub async fn deliver_ack(&self, id: &ConnId, result: Result<(), String>) {
        if let Some(conn) = self.get(id).await {
            conn.resolve_ack(result).await;
        }
    }

    /// Delivers a `DATA` frame's payload to the named connection's inbound buffer.
    pub async fn deliver_data(&self, id: &ConnId, payload: Bytes) -> Result<(), ErrorKind> {
        match self.get(id).await {
            Some(conn) => conn.push_inbound(payload).await,
            None => Ok(()), // connection already closed locally; peer hasn't caught up yet
        }
    }

    pub async fn mark_closing(&self, id: &ConnId) {
        if let Some(conn) = self.get(id).await {
            conn.set_state(ConnState::Closing);
        }
    }

    pub async fn remove(&self, id: &ConnId) -> Option<Arc<VirtualConn>> {
        let removed = self.conns.write().await.remove(id);
        if let Some(conn) = &removed {
            conn.close().await;
        }
        removed
    }

    /// Tears down every connection still registered, dropping each `inbound_tx` so the
    /// pump reading its `inbound_rx` observes EOF and closes the attached external
    /// socket, even while a `dispatch`/pump task keeps its own `Arc<VirtualConn>` clone
    /// alive. Used when the owning tunnel `Connection` dies (`spec.md` §4.F step 4).
    pub async fn close_all(&self) {
        for (_, conn) in self.conns.write().await.drain() {
            conn.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> TargetAddr {
        TargetAddr::Domain("example.com".into(), 80)
    }

    #[tokio::test]
    async fn open_then_ack_transitions_to_open() {
        let mux = Multiplexer::new();
        let id = ConnId::new_v4();
        let opened = mux.open(id, addr(), Protocol::Tcp).await;
        assert_eq!(opened.conn.state(), ConnState::Opening);

        mux.deliver_ack(&id, Ok(())).await;
        let (conn, _rx) = opened.wait_for_ack(&mux).await.expect("ack ok");
        assert_eq!(conn.state(), ConnState::Open);
        assert_eq!(mux.len().await, 1);
    }

    #[tokio::test]
    async fn ack_failure_removes_the_connection() {
        let mux = Multiplexer::new();
        let id = ConnId::new_v4();
        let opened = mux.open(id, addr(), Protocol::Tcp).await;
        mux.deliver_ack(&id, Err("refused".into())).await;
        let err = opened.wait_for_ack(&mux).await.unwrap_err();
        assert!(matches!(err, ErrorKind::UpstreamRefused { .. }));
        assert_eq!(mux.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out_after_ten_seconds() {
        let mux = Arc::new(Multiplexer::new());
        let id = ConnId::new_v4();
        let opened = mux.open(id, addr(), Protocol::Tcp).await;

        let waiter_mux = mux.clone();
        let waiter = tokio::spawn(async move { opened.wait_for_ack(&waiter_mux).await });
        tokio::time::advance(CONNECT_ACK_TIMEOUT + Duration::from_millis(1)).await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ErrorKind::UpstreamRefused { .. }));
    }

    #[tokio::test]
    async fn backpressure_releases_after_consumer_drains() {
        let mux = Multiplexer::new();
        let id = ConnId::new_v4();
        let (conn, mut rx) = mux.accept(id, addr(), Protocol::Tcp).await;

        let chunk = Bytes::from(vec![0u8; INBOUND_BUFFER_CAPACITY as usize]);
        conn.push_inbound(chunk.clone()).await.expect("fits exactly");

        let conn2 = conn.clone();
        let push_more = tokio::spawn(async move { conn2.push_inbound(Bytes::from_static(b"more")).await });

        let drained = rx.recv().await.expect("first chunk");
        assert_eq!(drained.len(), chunk.len());
        conn.release_inbound(drained.len());

        push_more.await.unwrap().expect("room freed after release");
    }
}
