pub mod context;
pub mod credentials;
pub mod error;
pub mod frame;
pub mod log;
pub mod metrics;
pub mod mux;
pub mod transport;
pub mod types;

pub use context::AppContext;
pub use error::{Error, ErrorKind, Result};
