use thiserror::Error;

/// Why a terminal connection gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionFailure {
    /// Retries were exhausted without a single successful open.
    #[error(
        "could not connect to terminal after {initial_attempts} attempt(s) and {reconnect_attempts} reconnect(s)"
    )]
    NeverConnected {
        initial_attempts: u32,
        reconnect_attempts: u32,
    },

    /// The terminal was connected, dropped, and every reconnect failed.
    #[error("connection to terminal lost; {reconnect_attempts} reconnect attempt(s) failed")]
    ConnectionLost { reconnect_attempts: u32 },
}

/// Failure to open one socket.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid terminal url '{0}'")]
    InvalidUrl(String),

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("transport error: {0}")]
    Transport(String),
}
