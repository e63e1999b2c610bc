//! Configuration module
//!
//! The server is configured through environment variables, all optional:
//! `METHOD` (AEAD cipher), `PASS` (passphrase), `PORT` (listen port). CLI
//! flags override them in `main`.

use crate::crypto::CipherKind;
use crate::{Error, Result};

pub const DEFAULT_METHOD: &str = "chacha20-poly1305";
pub const DEFAULT_PASSWORD: &str = "secret";
pub const DEFAULT_PORT: u16 = 80;

/// Main configuration structure
#[derive(Debug, Clone)]
pub struct Config {
    /// AEAD cipher method
    pub method: CipherKind,

    /// Passphrase feeding the master-key derivation
    pub password: String,

    /// TCP port to listen on
    pub port: u16,
}

impl Config {
    /// Load configuration from the environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let method_name = lookup("METHOD").unwrap_or_else(|| DEFAULT_METHOD.to_string());
        let method = CipherKind::try_from(method_name.as_str())?;

        let password = lookup("PASS").unwrap_or_else(|| DEFAULT_PASSWORD.to_string());

        let port = match lookup("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| Error::config(format!("invalid PORT: {}", raw)))?,
            None => DEFAULT_PORT,
        };

        Ok(Config {
            method,
            password,
            port,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            method: CipherKind::ChaCha20Poly1305,
            password: DEFAULT_PASSWORD.to_string(),
            port: DEFAULT_PORT,
        }
    }
}
