//! Stork Core Library
//!
//! Shared functionality for the Stork server crates:
//! - Server configuration resolution
//! - SQLite pool helpers and the `define_database!` macro
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::ServerConfig;
pub use error::{Error, Result};
