use std::{fmt, io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: expected {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },

    #[error("sealed payload is too short ({0} bytes)")]
    SealedTooShort(usize),

    #[error("peer public key produced a non-contributory shared secret")]
    WeakSharedSecret,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("frame counter exhausted")]
    CounterExhausted,

    #[error("plaintext of {len} bytes exceeds the {max}-byte frame limit")]
    FrameTooLarge { len: usize, max: usize },
}

/// Phase of the server handshake a failure was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Hello,
    Certificate,
    KeyTransport,
    Confirmation,
    Username,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStep::Hello => "hello",
            HandshakeStep::Certificate => "certificate",
            HandshakeStep::KeyTransport => "key transport",
            HandshakeStep::Confirmation => "confirmation",
            HandshakeStep::Username => "username",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection closed during {step} step")]
    ConnectionClosed { step: HandshakeStep },

    #[error("transport error during {step} step: {source}")]
    Io {
        step: HandshakeStep,
        #[source]
        source: io::Error,
    },

    #[error("unexpected token during {step} step: {actual:?}")]
    UnexpectedToken { step: HandshakeStep, actual: String },

    #[error("crypto failure during {step} step: {source}")]
    Crypto {
        step: HandshakeStep,
        #[source]
        source: CryptoError,
    },

    #[error("malformed certificate: {0}")]
    Certificate(#[source] serde_json::Error),

    #[error("username must be 1 to {max} bytes of UTF-8", max = crate::handshake::MAX_USERNAME_LEN)]
    InvalidUsername,
}

impl HandshakeError {
    pub fn step(&self) -> HandshakeStep {
        match self {
            HandshakeError::ConnectionClosed { step }
            | HandshakeError::Io { step, .. }
            | HandshakeError::UnexpectedToken { step, .. }
            | HandshakeError::Crypto { step, .. } => *step,
            HandshakeError::Certificate(_) => HandshakeStep::Certificate,
            HandshakeError::InvalidUsername => HandshakeStep::Username,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("undecodable message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("reply is not valid UTF-8")]
    InvalidText,

    #[error("broadcast line of {len} bytes exceeds the {max}-byte frame limit")]
    LineTooLong { len: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum KeyProvisioningError {
    #[error("cannot access credential file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed credential file: {0}")]
    Format(#[from] serde_json::Error),

    #[error("credential secret is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be an IP address, got {value:?}")]
    BindAddress { name: &'static str, value: String },

    #[error("{name} must be `prune` or `log-only`, got {value:?}")]
    DeliveryPolicy { name: &'static str, value: String },
}
