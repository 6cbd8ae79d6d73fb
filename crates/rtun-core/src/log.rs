//! Thin wrapper over [`tracing`] that prefixes every event's `target` with the
//! emitting crate's name, so a single `RUST_LOG=rtun_gateway=debug` filter lines up
//! with `cargo metadata` package names regardless of module nesting.

/// Crate-qualified `target` string for the calling crate, computed at compile time.
#[macro_export]
macro_rules! log_target {
    () => {
        const_str::concat!(env!("CARGO_PKG_NAME"), "::", module_path!())
    };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        tracing::trace!(target: $crate::log_target!(), $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: $crate::log_target!(), $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        tracing::info!(target: $crate::log_target!(), $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: $crate::log_target!(), $($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        tracing::error!(target: $crate::log_target!(), $($arg)*)
    };
}
