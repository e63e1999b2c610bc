//! Shadowsocks AEAD tunnel server carried over WebSocket
//!
//! A client opens a WebSocket to this server and sends a Shadowsocks AEAD
//! ciphertext stream as binary messages: a request header naming the target,
//! then tunneled payload. The server decrypts, connects to the target over
//! TCP, and relays both directions with re-encryption on the return path.
//!
//! # Architecture
//!
//! ```text
//! +-----------+     +-----------+     +----------+     +------------+
//! |  inbound/ | --> | framing/  | --> |  relay/  | --> | target TCP |
//! | (HTTP/WS) |     | Decryptor |     |  (queue) |     |            |
//! +-----------+     +-----------+     +----------+     +------+-----+
//!       ^                                                     |
//!       |           +-----------+                             |
//!       +---------- | framing/  | <---------------------------+
//!                   | Encryptor |
//!                   +-----------+
//! ```
//!
//! `crypto/` supplies the key schedule (EVP_BytesToKey master key, HKDF-SHA1
//! sub-keys) and the per-direction AEAD contexts underneath both framers.

pub mod common;
pub mod config;
pub mod crypto;
pub mod framing;
pub mod inbound;
pub mod relay;

pub use common::error::{Error, Result};
pub use config::Config;

use crypto::CipherKind;
use inbound::HttpListener;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::info;

pub const VERSION: &str = "0.1.0";

/// Immutable state shared by every connection: the cipher method and the
/// master key, both fixed at startup.
pub struct ServerContext {
    pub method: CipherKind,
    pub key: Vec<u8>,
}

/// Server instance
pub struct Server {
    listener: HttpListener,
}

impl Server {
    /// Create a new server from configuration
    pub fn new(config: Config) -> Result<Self> {
        let method = config.method;
        let key = crypto::derive_key(&config.password, method.key_size());
        info!("using cipher method {}", method.name());

        let ctx = Arc::new(ServerContext { method, key });
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));

        Ok(Server {
            listener: HttpListener::new(ctx, addr),
        })
    }

    /// Serve until shutdown
    pub async fn run(&self) -> Result<()> {
        self.listener.start().await?;
        info!("server stopped");
        Ok(())
    }
}
