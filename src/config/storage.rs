//! Configuration Storage
//!
//! Reads the bastion configuration file from disk.
//! Default data location: ~/.local/share/sshbastion on Linux, platform data dir elsewhere

use std::path::{Path, PathBuf};
use tokio::fs;

use super::types::BastionConfig;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Get the sshbastion data directory
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sshbastion")
}

/// Load configuration from disk
/// Returns the default config if the file doesn't exist
pub async fn load_config(path: &Path) -> Result<BastionConfig, StorageError> {
    let config = match fs::read_to_string(path).await {
        Ok(contents) => serde_json::from_str::<BastionConfig>(&contents)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Config file {:?} not found, using defaults", path);
            BastionConfig::default()
        }
        Err(e) => return Err(StorageError::Io(e)),
    };

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &BastionConfig) -> Result<(), StorageError> {
    if config.bind_address.trim().is_empty() {
        return Err(StorageError::Invalid("bind_address is empty".to_string()));
    }

    match config.aes_key.len() {
        0 | 16 | 24 | 32 => {}
        n => {
            return Err(StorageError::Invalid(format!(
                "aes_key must be 16, 24 or 32 bytes long, got {}",
                n
            )))
        }
    }

    if config.max_hops == 0 {
        return Err(StorageError::Invalid("max_hops must be at least 1".to_string()));
    }

    Ok(())
}

/// Ensure the directories the server writes to exist
pub async fn ensure_dirs(config: &BastionConfig) -> Result<(), StorageError> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    fs::create_dir_all(&config.logs_location).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("missing.json");

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:2222");
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("bastion.json");
        let db = temp.path().join("db").join("bastion.redb");
        let body = serde_json::json!({
            "bind_address": "127.0.0.1:2022",
            "db_path": db,
            "aes_key": "0123456789abcdef",
            "acl_check_cmd": "acl-check",
        });
        fs::write(&path, body.to_string()).await.unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:2022");
        assert_eq!(config.db_path, db);
        assert_eq!(config.acl_hook(), Some("acl-check"));

        let mut config = config;
        config.logs_location = temp.path().join("log");
        ensure_dirs(&config).await.unwrap();
        assert!(temp.path().join("db").is_dir());
        assert!(temp.path().join("log").is_dir());
    }

    #[tokio::test]
    async fn test_rejects_bad_key_length() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("bastion.json");
        fs::write(&path, r#"{"aes_key": "short"}"#).await.unwrap();

        let err = load_config(&path).await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_rejects_malformed_json() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("bastion.json");
        fs::write(&path, "{ not json").await.unwrap();

        assert!(matches!(
            load_config(&path).await,
            Err(StorageError::Json(_))
        ));
    }
}
