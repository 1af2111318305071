//! Error types for the service binary.
//!
//! [`ServiceError`] wraps every failure that can stop the service during
//! startup. Once the refresh loop is running, failures are logged by the
//! engine and never surface here.

/// Top-level error for the service binary.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: quakewatch_core::ConfigError,
    },

    /// The snapshot store could not be reached.
    #[error("storage error: {source}")]
    Storage {
        /// The underlying storage error.
        #[from]
        source: quakewatch_db::DbError,
    },

    /// The upstream feed client could not be built.
    #[error("feed error: {source}")]
    Feed {
        /// The underlying feed error.
        #[from]
        source: quakewatch_core::FeedError,
    },

    /// The HTTP server failed to start.
    #[error("observer error: {source}")]
    Observer {
        /// The underlying startup error.
        #[from]
        source: quakewatch_observer::StartupError,
    },
}
