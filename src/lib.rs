#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! wol-relay library.
//!
//! - `tunnel`: controller listener, registry, liveness and command relay
//! - `credential`: HMAC handshake tokens for controllers
//! - `auth`: operator sessions and middleware
//! - `status`: connectivity fan-out to operator pages
//! - `routes`: operator HTTP handlers
//! - `wol`: magic packets, used by the controller emulator

pub mod auth;
pub mod config;
pub mod credential;
pub mod routes;
pub mod state;
pub mod status;
pub mod tunnel;
pub mod wol;

pub use config::Config;
pub use state::AppState;
pub use tunnel::TunnelState;
