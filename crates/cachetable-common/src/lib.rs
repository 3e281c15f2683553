//! Cachetable Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions, and configuration
//! used by the cachetable and by the layers that plug callbacks into it.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CachetableConfig, CheckpointConfig, CleanerConfig, EvictorConfig, KibbutzConfig};
pub use error::{CachetableError, Result};
pub use types::*;
