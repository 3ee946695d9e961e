//! HTTP API.
//!
//! Session operations are addressed by session id in the path and forwarded
//! to that session's runtime actor.

mod error;
mod handlers;
mod routes;
mod state;
mod terminal;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
