pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod merge;
pub mod model;
pub mod monitor;
pub mod services;
pub mod store;
pub mod subdivision;

pub use error::{BraidError, Result};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("braid tracing initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = BraidError::Config("missing field".into());
        assert_eq!(err.to_string(), "config error: missing field");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let braid_err: BraidError = io_err.into();
        assert!(matches!(braid_err, BraidError::Io(_)));
    }
}
