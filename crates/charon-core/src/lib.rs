//! charon-core
//!
//! Core types and contracts for the Charon GPU-instance control plane:
//! the record model, the key-value state store, cost accrual math,
//! deterministic naming, and boot-script composition. Everything here is
//! provider-agnostic; the upstream API lives in `charon-cloud`.

pub mod config;
pub mod cost;
pub mod error;
pub mod model;
pub mod naming;
pub mod store;
pub mod userdata;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use store::{FileStore, MemoryStore, StateStore, Store};
