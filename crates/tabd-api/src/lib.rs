//! # Tabd API
//!
//! The HTTP surface over [`tabd_core::Core`]: typed request/response bodies
//! in [`dto`], auth gating in [`auth`], a flat `{error: string}` mapping in
//! [`error`], and router assembly in [`routes`]. `main.rs` is just the
//! process entrypoint on top of [`routes::build_router`].

pub mod auth;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod payload_limit;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
