//! Bastion configuration types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::storage::data_dir;

/// Runtime configuration of the bastion, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BastionConfig {
    /// Address the SSH server listens on
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Path of the redb record store
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Key for at-rest secrets (host passwords, private keys). Empty disables encryption.
    #[serde(default)]
    pub aes_key: String,

    /// Transport inactivity timeout in seconds, 0 disables it
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// External command consulted after ACL resolution
    #[serde(default)]
    pub acl_check_cmd: Option<String>,

    /// Root directory for session recordings
    #[serde(default = "default_logs_location")]
    pub logs_location: PathBuf,

    /// Per-hop connect timeout in seconds
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Maximum number of hosts in one hop chain, target included
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_db_path() -> PathBuf {
    data_dir().join("bastion.redb")
}

fn default_logs_location() -> PathBuf {
    PathBuf::from("./log")
}

fn default_dial_timeout() -> u64 {
    30
}

fn default_max_hops() -> usize {
    16
}

impl Default for BastionConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            db_path: default_db_path(),
            aes_key: String::new(),
            idle_timeout_secs: 0,
            acl_check_cmd: None,
            logs_location: default_logs_location(),
            dial_timeout_secs: default_dial_timeout(),
            max_hops: default_max_hops(),
        }
    }
}

impl BastionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs.max(1))
    }

    /// The hook command, if one is configured and not blank
    pub fn acl_hook(&self) -> Option<&str> {
        self.acl_check_cmd
            .as_deref()
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BastionConfig =
            serde_json::from_str(r#"{"bind_address": "127.0.0.1:2200", "idle_timeout_secs": 300}"#)
                .unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:2200");
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.dial_timeout_secs, 30);
        assert_eq!(config.max_hops, 16);
        assert!(config.aes_key.is_empty());
    }

    #[test]
    fn test_zero_idle_timeout_disables() {
        let config = BastionConfig::default();
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn test_blank_acl_hook_is_ignored() {
        let mut config = BastionConfig::default();
        config.acl_check_cmd = Some("   ".to_string());
        assert_eq!(config.acl_hook(), None);

        config.acl_check_cmd = Some("/usr/local/bin/acl-check".to_string());
        assert_eq!(config.acl_hook(), Some("/usr/local/bin/acl-check"));
    }
}
