//! dostore Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, the persisted storage
//! properties and the small value types shared by the storage engine
//! and the tools built on top of it.

pub mod config;
pub mod error;
pub mod types;

pub use config::{HashAlgorithm, StorageProperties};
pub use error::{Error, Result};
pub use types::*;
