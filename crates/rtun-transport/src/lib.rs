pub mod framing;

#[cfg(feature = "grpc")]
pub mod grpc;
#[cfg(feature = "quic")]
pub mod quic;
#[cfg(feature = "websocket")]
pub mod ws;
