//! # Almanac Core
//!
//! Persistent settings registry for the gateway.
//!
//! This library provides everything below the transport:
//! - The settings tree: typed, bounded leaf settings inside nested groups
//! - Unique `class:instance` identities for devices
//! - The on-disk XML document, crash-safe writes and debounced saves
//! - Versioned schema migrations applied at load
//! - Factory default overlays
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        almanacd                          │
//! │   Unix socket ──► event loop ──► Registry                │
//! └──────────────────────────┬───────────────────────────────┘
//!                            │
//! ┌──────────────────────────┴───────────────────────────────┐
//! │                       Registry                           │
//! │  ┌──────────────┐  ┌────────────────┐  ┌──────────────┐  │
//! │  │     Tree     │  │ Persistence    │  │  Migration   │  │
//! │  │ + Allocator  │  │ Engine         │  │  Pipeline    │  │
//! │  └──────────────┘  └───────┬────────┘  └──────────────┘  │
//! │                            │                             │
//! │                    settings.xml (+ .new)                 │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod allocator;
mod defaults;
mod document;
mod error;
mod event;
mod ipc;
mod migration;
mod node;
mod persist;
mod registry;
mod tree;
mod value;

pub use allocator::*;
pub use defaults::{load_dir as load_defaults_dir, load_file as load_defaults_file, parse_line as parse_defaults_line, DefaultEntry};
pub use document::*;
pub use error::*;
pub use event::*;
pub use ipc::*;
pub use migration::*;
pub use node::*;
pub use persist::*;
pub use registry::*;
pub use tree::*;
pub use value::*;

/// Re-export common types
pub mod prelude {
    pub use crate::error::{AddError, PersistError, RegistryError, SetError};
    pub use crate::event::ChangeEvent;
    pub use crate::ipc::{ResponseData, SettingsRequest, SettingsResponse};
    pub use crate::registry::{Registry, RegistryOptions};
    pub use crate::tree::{AddOptions, SettingDefinition, Tree};
    pub use crate::value::{Value, ValueType};
}
