//! smrdb Common - Shared types and utilities
//!
//! This crate provides the error type, disk configuration and the small
//! value types shared by the storage core and the operational tooling.

pub mod config;
pub mod error;
pub mod types;

pub use config::DiskConfig;
pub use error::{Error, Result};
pub use types::*;
