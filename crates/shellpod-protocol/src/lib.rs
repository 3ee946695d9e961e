//! Wire types for shellpod.
//!
//! ```text
//! Terminal tab <--[WS: raw bytes + resize frames]--> shellpod <--[WS]--> container terminal server
//!                                                       |
//!                                          GET /health, GET /activity
//! ```
//!
//! The duplex terminal stream is opaque: binary frames carry raw bytes in both
//! directions. The only structured message is the [`ControlFrame`] sent as a
//! JSON text frame.

pub mod activity;
pub mod control;
pub mod identity;

pub use activity::{ActivitySnapshot, HealthPayload};
pub use control::{CloseKind, ControlFrame, ControlFrameError, classify_close_code};
pub use identity::{GetIdentityResponse, SetIdentityRequest, SetIdentityResponse};
