//! Terminal connection manager.
//!
//! One duplex socket per terminal tab, keyed by [`TerminalKey`]. Each key is
//! driven by its own task that opens, retries, reconnects and tears down the
//! socket, forwards input and output, and keeps the remote geometry in sync.

mod config;
mod connector;
mod error;
mod key;
mod manager;
mod render;
mod state;

pub use config::ManagerConfig;
pub use connector::{Connector, Incoming, Outgoing, Socket, WsConnector};
pub use error::{ConnectError, ConnectionFailure};
pub use key::TerminalKey;
pub use manager::{DisposeHandle, ErrorCallback, TerminalManager};
pub use render::RenderTarget;
pub use state::{ConnectionState, RetryCounters};
