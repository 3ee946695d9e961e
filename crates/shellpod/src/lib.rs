//! Shellpod server library.
//!
//! One container per session, owned by a session runtime actor that starts
//! it on demand and reclaims it once it stops or goes idle.

pub mod activity;
pub mod api;
pub mod config;
pub mod container;
pub mod db;
pub mod lifecycle;
pub mod resilience;
pub mod store;
