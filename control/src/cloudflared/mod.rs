//! cloudflared integration
//!
//! - `config`: tunnel configuration file model and atomic writes
//! - `sync`: keeps the file in step with the ingress tracker
//! - `daemon`: optional cloudflared process supervision

pub mod config;
pub mod daemon;
pub mod sync;

pub use config::{IngressRule, TunnelConfig, CATCH_ALL_SERVICE};
pub use daemon::CloudflaredDaemon;
pub use sync::ConfigSync;
