//! Observer hook for session lifecycle events. No exporter (Prometheus, StatsD, ...) is
//! implemented here — that belongs outside this crate. [`NoopObserver`] is the default
//! wired into both `ClientSession` and `GatewaySession`.

use crate::types::ConnId;

/// Notified of virtual connection lifecycle events. Every method must be safe to call
/// more than once for the same `conn_id` (e.g. a close race between the peer and a
/// local timeout) — implementations should treat repeat calls as idempotent.
pub trait SessionObserver: Send + Sync + 'static {
    fn on_conn_open(&self, conn_id: ConnId) {
        let _ = conn_id;
    }

    fn on_bytes(&self, conn_id: ConnId, direction: Direction, len: usize) {
        let _ = (conn_id, direction, len);
    }

    fn on_conn_close(&self, conn_id: ConnId, reason: CloseReason) {
        let _ = (conn_id, reason);
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloseReason {
    PeerClosed,
    LocalClosed,
    BackpressureTimeout,
    TransportDead,
}

#[derive(Copy, Clone, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}
