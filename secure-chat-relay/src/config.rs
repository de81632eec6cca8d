//! Runtime configuration: the CLI port plus a few environment overrides.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use crate::{
    credential::{DEFAULT_SUBJECT, FileKeyProvider, GeneratedKeyProvider, KeyProvider},
    error::ConfigError,
    session::DeliveryPolicy,
};

pub const BIND_VAR: &str = "CHAT_RELAY_BIND";
pub const CREDENTIAL_VAR: &str = "CHAT_RELAY_CREDENTIAL";
pub const SUBJECT_VAR: &str = "CHAT_RELAY_SUBJECT";
pub const DELIVERY_VAR: &str = "CHAT_RELAY_DELIVERY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: IpAddr,
    pub credential: Option<PathBuf>,
    pub subject: String,
    pub delivery: DeliveryPolicy,
}

impl ServerConfig {
    pub fn from_env(port: u16) -> Result<Self, ConfigError> {
        Self::from_lookup(port, |name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(port: u16, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let bind = match lookup(BIND_VAR) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::BindAddress {
                    name: BIND_VAR,
                    value,
                })?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let delivery = match lookup(DELIVERY_VAR) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::DeliveryPolicy {
                    name: DELIVERY_VAR,
                    value,
                })?,
            None => DeliveryPolicy::default(),
        };

        Ok(Self {
            port,
            bind,
            credential: lookup(CREDENTIAL_VAR).map(PathBuf::from),
            subject: lookup(SUBJECT_VAR).unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            delivery,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn key_provider(&self) -> Box<dyn KeyProvider> {
        match &self.credential {
            Some(path) => Box::new(FileKeyProvider::new(path.clone())),
            None => Box::new(GeneratedKeyProvider::new(self.subject.clone())),
        }
    }
}
