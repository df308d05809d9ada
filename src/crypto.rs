use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use ctr::Ctr128BE;

use crate::consts::NONCE_SIZE;

/// In-place symmetric block-cipher oracle. The protocol only needs *an*
/// encrypt/decrypt pair keyed identically on both ends, not any particular
/// cipher's internals.
pub trait BlockCrypt: Send + Sync {
    /// Encrypts `buf` in place. `buf[..NONCE_SIZE]` holds the packet's
    /// nonce; everything after it is the crypto-header-and-payload.
    fn encrypt(&self, buf: &mut [u8]);
    /// Inverse of [`encrypt`](BlockCrypt::encrypt).
    fn decrypt(&self, buf: &mut [u8]);
}

/// AES-128 block cipher: the packet's leading nonce block is whitened with
/// a single ECB encrypt (so the wire nonce is never the plaintext nonce —
/// satisfying "the cipher encrypts the whole datagram including the
/// nonce"), then that same plaintext nonce seeds a CTR keystream over the
/// rest of the datagram. Both sides only need the wire nonce to invert: ECB
/// decrypt it to recover the seed, then run CTR with that seed.
pub struct Aes128Crypt {
    key: [u8; NONCE_SIZE],
    ecb: Aes128,
}

impl Aes128Crypt {
    pub fn new(key: [u8; NONCE_SIZE]) -> Self {
        Aes128Crypt {
            key,
            ecb: Aes128::new(&key.into()),
        }
    }

    fn stream(&self, seed: [u8; NONCE_SIZE]) -> Ctr128BE<Aes128> {
        Ctr128BE::<Aes128>::new(&self.key.into(), &seed.into())
    }
}

impl BlockCrypt for Aes128Crypt {
    fn encrypt(&self, buf: &mut [u8]) {
        if buf.len() < NONCE_SIZE {
            return;
        }
        let (nonce, rest) = buf.split_at_mut(NONCE_SIZE);
        let seed: [u8; NONCE_SIZE] = nonce.try_into().unwrap();

        let mut block = aes::Block::clone_from_slice(nonce);
        self.ecb.encrypt_block(&mut block);
        nonce.copy_from_slice(&block);

        self.stream(seed).apply_keystream(rest);
    }

    fn decrypt(&self, buf: &mut [u8]) {
        if buf.len() < NONCE_SIZE {
            return;
        }
        let (nonce, rest) = buf.split_at_mut(NONCE_SIZE);

        let mut block = aes::Block::clone_from_slice(nonce);
        self.ecb.decrypt_block(&mut block);
        let seed: [u8; NONCE_SIZE] = block.into();

        self.stream(seed).apply_keystream(rest);
    }
}

/// Computes the IEEE CRC32 over `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Outcome of [`open_datagram`]: the decrypted/verified payload, or which of
/// the two drop reasons applies.
pub(crate) enum Opened {
    Payload(Vec<u8>),
    Malformed,
    ChecksumMismatch,
}

/// Shared ingress preamble for [`Session`](crate::Session) and
/// [`Listener`](crate::Listener): decrypts `datagram` in place (if `crypto`
/// is configured) and verifies its CRC32, returning the bytes after the
/// crypto header. With no crypto configured, returns `datagram` verbatim.
pub(crate) fn open_datagram(datagram: &[u8], crypto: Option<&dyn BlockCrypt>) -> Opened {
    let Some(crypt) = crypto else {
        return Opened::Payload(datagram.to_vec());
    };
    if datagram.len() < crate::consts::CRYPTO_HEADER_SIZE {
        return Opened::Malformed;
    }
    let mut buf = datagram.to_vec();
    crypt.decrypt(&mut buf);

    let crc_stated = u32::from_le_bytes(
        buf[crate::consts::NONCE_SIZE..crate::consts::CRYPTO_HEADER_SIZE]
            .try_into()
            .unwrap(),
    );
    let crc_actual = crc32(&buf[crate::consts::CRYPTO_HEADER_SIZE..]);
    if crc_stated != crc_actual {
        return Opened::ChecksumMismatch;
    }
    buf.drain(..crate::consts::CRYPTO_HEADER_SIZE);
    Opened::Payload(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_is_identity() {
        let crypt = Aes128Crypt::new([7u8; 16]);
        let mut buf = vec![0u8; 64];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = i as u8;
        }
        let original = buf.clone();

        crypt.encrypt(&mut buf);
        assert_ne!(buf, original);

        crypt.decrypt(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn different_packets_produce_different_ciphertext_at_same_offset() {
        let crypt = Aes128Crypt::new([1u8; 16]);

        let mut a = vec![0xAAu8; 32];
        let mut b = vec![0xAAu8; 32];
        a[..NONCE_SIZE].copy_from_slice(&[1u8; NONCE_SIZE]);
        b[..NONCE_SIZE].copy_from_slice(&[2u8; NONCE_SIZE]);

        crypt.encrypt(&mut a);
        crypt.encrypt(&mut b);

        assert_ne!(a[NONCE_SIZE..], b[NONCE_SIZE..]);
    }

    #[test]
    fn crc32_detects_corruption() {
        let data = b"hello kcp".to_vec();
        let good = crc32(&data);
        let mut corrupted = data.clone();
        corrupted[0] ^= 0xFF;
        assert_ne!(good, crc32(&corrupted));
    }
}
