//! matl-client - Client for the MATL Online interpreter service.
//!
//! The service runs MATL programs remotely and streams their output back
//! over a Socket.IO channel. This crate keeps that channel alive, drives one
//! run at a time through submit / acknowledge / stream / complete (including
//! resubmission when an acknowledgement never arrives), and turns the
//! streamed status batches into buffers a front end can render.
//!
//! The HTTP side of the service (code explanation, the function reference
//! and image sharing), permalinks, documentation search and the input paste
//! helpers live here too, so front ends only deal with presentation.
//!
//! Start with [`client::ClientHandle::connect`].

pub mod analytics;
pub mod api;
pub mod client;
pub mod config;
pub mod connection;
pub mod docs;
pub mod encoder;
pub mod media;
pub mod output;
pub mod packet;
pub mod permalink;
pub mod protocol;
pub mod session;

pub use client::{ClientError, ClientHandle, View};
pub use config::{load_config, ClientConfig};
pub use session::{Affordance, RunRequest};

/// Interpreter version used when neither the user nor the config names one.
pub const DEFAULT_VERSION: &str = "22.7.4";

/// The version to run: explicit choice, then the configured default, then
/// [`DEFAULT_VERSION`].
pub fn resolve_version(explicit: Option<&str>, config: &ClientConfig) -> String {
    explicit
        .or(config.default_version.as_deref())
        .unwrap_or(DEFAULT_VERSION)
        .to_string()
}
