//! Configuration Management Module
//!
//! Loads and validates the bastion's JSON configuration file.

pub mod storage;
pub mod types;

pub use storage::{data_dir, ensure_dirs, load_config, validate, StorageError};
pub use types::BastionConfig;
