//! cflb Control Plane Library
//!
//! Exposes the Service controller, the ingress tracker and the cloudflared
//! config sync for the binary and integration tests.

pub mod apis;
pub mod cloudflared;
pub mod config;
pub mod controller;
pub mod error;
pub mod queue;
pub mod server;
pub mod tracker;
