//! `dropfarm` core library.
//!
//! Shared pieces used by the daemon: configuration loading, persisted
//! per-account and global databases, redemption-key validation, error
//! types and tracing setup.

pub mod config;
pub mod database;
pub mod error;
pub mod keys;
pub mod tracing_init;

pub use error::{CoreError, Result};
