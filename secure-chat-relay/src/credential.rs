//! Server identity: the X25519 secret and the certificate handed to clients.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    crypto::PUBLIC_KEY_LEN,
    error::{CryptoError, KeyProvisioningError},
};

pub const DEFAULT_SUBJECT: &str = "secure-chat-relay";

/// Public half of the server credential, sent during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Certificate {
    pub subject: String,
    pub public_key: String,
    pub issued_at: DateTime<Utc>,
}

impl Certificate {
    fn issue(subject: &str, public_key: &PublicKey) -> Self {
        Self {
            subject: subject.to_string(),
            public_key: hex::encode(public_key.as_bytes()),
            issued_at: Utc::now(),
        }
    }

    pub fn public_key(&self) -> Result<PublicKey, CryptoError> {
        let bytes = hex::decode(&self.public_key).map_err(|_| CryptoError::KeyLength {
            expected: PUBLIC_KEY_LEN,
            actual: self.public_key.len() / 2,
        })?;
        let bytes: [u8; PUBLIC_KEY_LEN] =
            bytes.as_slice().try_into().map_err(|_| CryptoError::KeyLength {
                expected: PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(PublicKey::from(bytes))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Private key and certificate, loaded once and shared read-only.
pub struct ServerCredential {
    secret: StaticSecret,
    certificate: Certificate,
}

impl ServerCredential {
    pub fn from_secret(subject: &str, secret: StaticSecret) -> Self {
        let certificate = Certificate::issue(subject, &PublicKey::from(&secret));
        Self {
            secret,
            certificate,
        }
    }

    pub fn generate(subject: &str) -> Self {
        Self::from_secret(subject, StaticSecret::random_from_rng(OsRng))
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }
}

/// Source of the server credential, consulted once at startup.
pub trait KeyProvider {
    fn load(&self) -> Result<ServerCredential, KeyProvisioningError>;
}

/// Issues a fresh credential for every process.
pub struct GeneratedKeyProvider {
    subject: String,
}

impl GeneratedKeyProvider {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

impl KeyProvider for GeneratedKeyProvider {
    fn load(&self) -> Result<ServerCredential, KeyProvisioningError> {
        Ok(ServerCredential::generate(&self.subject))
    }
}

#[derive(Serialize, Deserialize)]
struct CredentialFile {
    subject: String,
    secret_key: String,
}

/// Reads `{"subject": ..., "secret_key": "<hex>"}` from disk.
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generates a new secret and stores it at this provider's path.
    pub fn write_generated(&self, subject: &str) -> Result<(), KeyProvisioningError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let file = CredentialFile {
            subject: subject.to_string(),
            secret_key: hex::encode(secret.to_bytes()),
        };
        let encoded = serde_json::to_vec_pretty(&file)?;
        fs::write(&self.path, encoded).map_err(|source| KeyProvisioningError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl KeyProvider for FileKeyProvider {
    fn load(&self) -> Result<ServerCredential, KeyProvisioningError> {
        let raw = fs::read(&self.path).map_err(|source| KeyProvisioningError::Io {
            path: self.path.clone(),
            source,
        })?;
        let file: CredentialFile = serde_json::from_slice(&raw)?;
        let bytes = hex::decode(file.secret_key.trim())?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| CryptoError::KeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(ServerCredential::from_secret(
            &file.subject,
            StaticSecret::from(bytes),
        ))
    }
}
