use std::sync::Mutex;

use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::consts::NONCE_SIZE;
use crate::err::{Error, Result};

/// Produces a fresh, unpredictable 16-byte value per call. The concrete
/// design is AES-128 run in counter mode, keyed and seeded from a secure
/// random source at construction. A session that can't get entropy at
/// construction can't be created — entropy failure is a construction-time
/// error, never a runtime one.
pub struct NonceSource {
    cipher: Mutex<Ctr128BE<Aes128>>,
}

impl NonceSource {
    pub fn new() -> Result<Self> {
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut key)
            .map_err(|e| Error::NonceSource(e.to_string()))?;
        OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|e| Error::NonceSource(e.to_string()))?;

        let cipher = Ctr128BE::<Aes128>::new(&key.into(), &iv.into());
        Ok(NonceSource {
            cipher: Mutex::new(cipher),
        })
    }

    /// Draws the next `NONCE_SIZE` bytes of keystream. Uniqueness within one
    /// session's lifetime is overwhelmingly likely: the keystream only
    /// repeats once the 128-bit counter wraps.
    pub fn next(&self) -> [u8; NONCE_SIZE] {
        let mut buf = [0u8; NONCE_SIZE];
        self.cipher.lock().unwrap().apply_keystream(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successive_nonces_differ() {
        let src = NonceSource::new().unwrap();
        let a = src.next();
        let b = src.next();
        assert_ne!(a, b);
    }

    #[test]
    fn independent_sources_differ() {
        let a = NonceSource::new().unwrap().next();
        let b = NonceSource::new().unwrap().next();
        assert_ne!(a, b);
    }
}
