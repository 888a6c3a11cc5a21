pub mod config;
pub mod error;
pub mod response;

pub mod handlers;
pub mod models;
pub mod routes;
pub mod runtime;
pub mod services;
pub mod storage;

/// Reported in heartbeats, health summaries and the HTTP user agent
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");
