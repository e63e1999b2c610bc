//! Stream framing for the AEAD tunnel protocol
//!
//! Each direction of a connection is a salt followed by sealed chunk pairs:
//!
//! ```plain
//! +--------+   +-----------+----------+   +-----------+----------+
//! |  Salt  |   | *DataLen* | Len_TAG  |   |  *Data*   | Data_TAG |
//! +--------+   +-----------+----------+   +-----------+----------+
//! | 32     |   |     2     |    16    |   | 1..0x3FFF |    16    |
//! +--------+   +-----------+----------+   +-----------+----------+
//! ```
//!
//! The length frame always precedes its payload frame and the plaintext
//! length must stay in `1..=0x3FFF`.

use crate::crypto::{derive_subkey, generate_salt, CipherKind, SessionCipher};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};

/// An AEAD payload frame carries at most this much plaintext
pub const MAX_PAYLOAD_SIZE: usize = 0x3FFF;

const LENGTH_SIZE: usize = 2;

/// Streaming decryptor for the inbound half of a tunnel connection.
///
/// Ciphertext arrives in arbitrary splits; `feed` buffers what is not yet
/// decodable and yields every payload that completed. The decrypt sub-key
/// comes up lazily once the client's salt has fully arrived.
pub struct Decryptor {
    kind: CipherKind,
    key: Vec<u8>,
    cipher: Option<SessionCipher>,
    buffer: BytesMut,
    /// Ciphertext size of the next frame, tag excluded
    expected_len: usize,
    /// Even frames carry a length, odd frames carry data
    chunk_index: u64,
}

impl Decryptor {
    pub fn new(kind: CipherKind, key: Vec<u8>) -> Self {
        Decryptor {
            kind,
            key,
            cipher: None,
            buffer: BytesMut::with_capacity(4096),
            expected_len: LENGTH_SIZE,
            chunk_index: 0,
        }
    }

    /// Absorb a chunk of ciphertext and return the payloads that completed.
    ///
    /// How the stream is split across calls never changes the output
    /// sequence. A failed tag or an out-of-range length is fatal for the
    /// connection.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        if self.cipher.is_none() {
            let salt_size = self.kind.salt_size();
            if self.buffer.len() < salt_size {
                return Ok(Vec::new());
            }
            let salt = self.buffer.split_to(salt_size);
            let subkey = derive_subkey(&self.key, &salt);
            self.cipher = Some(SessionCipher::new(self.kind, &subkey)?);
        }

        let cipher = match self.cipher.as_mut() {
            Some(cipher) => cipher,
            None => return Ok(Vec::new()),
        };

        let tag_size = self.kind.tag_size();
        let mut payloads = Vec::new();

        while self.buffer.len() >= self.expected_len + tag_size {
            let frame = self.buffer.split_to(self.expected_len + tag_size);
            let plaintext = cipher.decrypt(&frame)?;

            if self.chunk_index % 2 == 0 {
                let len = u16::from_be_bytes([plaintext[0], plaintext[1]]) as usize;
                if len == 0 || len > MAX_PAYLOAD_SIZE {
                    return Err(Error::protocol(format!(
                        "payload length {:#06x} out of range",
                        len
                    )));
                }
                self.expected_len = len;
            } else {
                payloads.push(Bytes::from(plaintext));
                self.expected_len = LENGTH_SIZE;
            }
            self.chunk_index += 1;
        }

        Ok(payloads)
    }
}

/// Encrypting framer for the outbound half of a tunnel connection.
///
/// Construction picks the salt and derives the encrypt sub-key; the salt is
/// emitted exactly once, in front of the first wrapped bytes.
pub struct Encryptor {
    cipher: SessionCipher,
    salt: Option<Bytes>,
}

impl Encryptor {
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self> {
        let salt = generate_salt(kind)?;
        let subkey = derive_subkey(key, &salt);

        Ok(Encryptor {
            cipher: SessionCipher::new(kind, &subkey)?,
            salt: Some(Bytes::from(salt)),
        })
    }

    /// Frame and seal a chunk of remote data, coalescing all frames into one
    /// buffer so the transport can send them as a single message.
    ///
    /// Inputs larger than [`MAX_PAYLOAD_SIZE`] are split. An empty input
    /// flushes just the pending salt.
    pub fn wrap(&mut self, data: &[u8]) -> Result<BytesMut> {
        let mut out = BytesMut::with_capacity(data.len() + 128);

        if let Some(salt) = self.salt.take() {
            out.extend_from_slice(&salt);
        }

        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            let len = (chunk.len() as u16).to_be_bytes();
            out.extend_from_slice(&self.cipher.encrypt(&len)?);
            out.extend_from_slice(&self.cipher.encrypt(chunk)?);
        }

        Ok(out)
    }
}
