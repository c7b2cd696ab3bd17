//! Almanac - Persistent settings registry daemon
//!
//! Serves the settings tree of `almanac-core` over a Unix socket:
//! - One event loop owns the registry and runs the debounced saves
//! - JSON-lines requests, one response per line
//! - Change events streamed to subscribed connections

pub mod client;
pub mod config;
pub mod ipc;
pub mod service;
