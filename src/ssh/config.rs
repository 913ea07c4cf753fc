//! Dial configuration for upstream hosts

use std::fmt;
use std::sync::Arc;

use russh::keys::PrivateKey;
use zeroize::Zeroizing;

use super::error::SshError;
use crate::crypto::SecretBox;
use crate::store::{Host, RecordStore};

const DEFAULT_PORT: u16 = 22;

/// Credential used to log in to an upstream host
pub enum ClientAuth {
    Key(Arc<PrivateKey>),
    Password(Zeroizing<String>),
}

impl fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientAuth::Key(_) => f.write_str("Key(..)"),
            ClientAuth::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// Everything needed to dial one hop
#[derive(Debug)]
pub struct DialSpec {
    pub host: Host,
    pub address: String,
    pub port: u16,
    pub username: String,
    /// Tried in order, key before password
    pub auth: Vec<ClientAuth>,
}

impl DialSpec {
    /// Build the dial spec for `host`, decrypting its credentials
    pub async fn for_host(
        host: Host,
        store: &dyn RecordStore,
        secrets: &SecretBox,
    ) -> Result<Self, SshError> {
        let (address, port) = parse_host_addr(&host.addr)?;

        let mut auth = Vec::new();
        if let Some(key_id) = host.ssh_key_id {
            let key = store.ssh_key_by_id(key_id).await?.ok_or_else(|| {
                SshError::KeyError(format!("SSH key #{} of host {:?} not found", key_id, host.name))
            })?;
            let pem = secrets.decrypt_or_raw(&key.private_key);
            auth.push(ClientAuth::Key(Arc::new(parse_private_key(&pem)?)));
        }
        if !host.password.is_empty() {
            auth.push(ClientAuth::Password(secrets.decrypt_or_raw(&host.password)));
        }
        if auth.is_empty() {
            return Err(SshError::NoAuthMethod(host.name.clone()));
        }

        Ok(Self {
            address,
            port,
            username: host.user.clone(),
            auth,
            host,
        })
    }
}

/// Parse an OpenSSH or PEM private key
pub fn parse_private_key(pem: &str) -> Result<PrivateKey, SshError> {
    russh::keys::decode_secret_key(pem, None).map_err(|e| SshError::KeyError(e.to_string()))
}

/// Split `host[:port]` into host and port.
///
/// IPv6 literals must be bracketed to carry a port (`[::1]:2222`); an unbracketed
/// address with several colons is taken as a bare IPv6 address.
pub fn parse_host_addr(addr: &str) -> Result<(String, u16), SshError> {
    let addr = addr.trim();
    let invalid = || SshError::ConnectionFailed(format!("invalid host address {:?}", addr));

    if addr.is_empty() {
        return Err(invalid());
    }

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = match tail {
            "" => DEFAULT_PORT,
            tail => tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .ok_or_else(invalid)?,
        };
        return Ok((host.to_string(), port));
    }

    match addr.split_once(':') {
        Some((host, port)) if !port.contains(':') => {
            if host.is_empty() {
                return Err(invalid());
            }
            let port = port.parse().map_err(|_| invalid())?;
            Ok((host.to_string(), port))
        }
        _ => Ok((addr.to_string(), DEFAULT_PORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LoggingMode, RedbRecordStore};
    use tempfile::tempdir;

    #[test]
    fn test_parse_host_addr() {
        assert_eq!(parse_host_addr("example.com").unwrap(), ("example.com".to_string(), 22));
        assert_eq!(parse_host_addr("10.0.0.1:2222").unwrap(), ("10.0.0.1".to_string(), 2222));
        assert_eq!(parse_host_addr("[::1]:2200").unwrap(), ("::1".to_string(), 2200));
        assert_eq!(parse_host_addr("[fe80::1]").unwrap(), ("fe80::1".to_string(), 22));
        assert_eq!(parse_host_addr("fe80::1").unwrap(), ("fe80::1".to_string(), 22));
    }

    #[test]
    fn test_parse_host_addr_invalid() {
        assert!(parse_host_addr("").is_err());
        assert!(parse_host_addr("host:notaport").is_err());
        assert!(parse_host_addr("[::1").is_err());
        assert!(parse_host_addr("[::1]2222").is_err());
        assert!(parse_host_addr(":22").is_err());
    }

    #[tokio::test]
    async fn test_dial_spec_requires_credentials() {
        let temp = tempdir().unwrap();
        let store = RedbRecordStore::open(&temp.path().join("db.redb")).unwrap();
        let host = Host {
            name: "db".to_string(),
            addr: "db.internal".to_string(),
            user: "root".to_string(),
            ..Default::default()
        };

        let err = DialSpec::for_host(host, &store, &SecretBox::disabled())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no valid authentication method for host \"db\"");
    }

    #[tokio::test]
    async fn test_dial_spec_decrypts_password() {
        let temp = tempdir().unwrap();
        let store = RedbRecordStore::open(&temp.path().join("db.redb")).unwrap();
        let secrets = SecretBox::new("0123456789abcdef0123456789abcdef");
        let host = Host {
            name: "db".to_string(),
            addr: "[2001:db8::5]:2022".to_string(),
            user: "root".to_string(),
            password: secrets.encrypt("hunter2").unwrap(),
            logging: LoggingMode::Input,
            ..Default::default()
        };

        let spec = DialSpec::for_host(host, &store, &secrets).await.unwrap();
        assert_eq!(spec.address, "2001:db8::5");
        assert_eq!(spec.port, 2022);
        assert_eq!(spec.username, "root");
        match &spec.auth[..] {
            [ClientAuth::Password(password)] => assert_eq!(password.as_str(), "hunter2"),
            other => panic!("unexpected auth methods: {:?}", other),
        }
    }
}
