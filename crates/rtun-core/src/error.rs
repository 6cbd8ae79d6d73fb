use snafu::Snafu;

use crate::types::Protocol;

/// Structured, matchable error taxonomy shared by every component. Component-level
/// functions return `Result<T>` (this module's alias); session and runtime entry points
/// wrap these into `eyre::Report` once there is nothing left to match on.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ErrorKind {
    #[snafu(display("authentication failed for group {group_id}"))]
    AuthFailed { group_id: String },

    #[snafu(display("no client available for group {group_id}"))]
    NoClientAvailable { group_id: String },

    #[snafu(display("upstream refused connection: {reason}"))]
    UpstreamRefused { reason: String },

    #[snafu(display("transport is dead: {reason}"))]
    TransportDead { reason: String },

    #[snafu(display("protocol error: {reason}"))]
    ProtocolError { reason: String },

    #[snafu(display("port {remote_port}/{protocol} is already bound"))]
    PortConflict { remote_port: u16, protocol: Protocol },

    #[snafu(display("virtual connection {conn_id} timed out waiting for backpressure to clear"))]
    BackpressureTimeout { conn_id: uuid::Uuid },

    #[snafu(display("configuration error: {reason}"))]
    ConfigError { reason: String },

    #[snafu(display("i/o error"))]
    Io { source: std::io::Error },
}

pub type Error = ErrorKind;
pub type Result<T, E = ErrorKind> = std::result::Result<T, E>;

impl From<std::io::Error> for ErrorKind {
    fn from(source: std::io::Error) -> Self {
        ErrorKind::Io { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        let err = ErrorKind::PortConflict {
            remote_port: 8080,
            protocol: Protocol::Tcp,
        };
        assert_eq!(err.to_string(), "port 8080/tcp is already bound");
    }
}
