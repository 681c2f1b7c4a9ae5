pub mod fingerprint;

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use fingerprint::Fingerprint;

/// Length of the shared secret in bytes
pub const KEY_LEN: usize = 32;
/// Little-endian u32 ciphertext length prefix
pub const LENGTH_LEN: usize = 4;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Smallest packet that can possibly be valid (empty ciphertext)
pub const HEADER_LEN: usize = LENGTH_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("packet truncated: {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },
    #[error("authentication tag mismatch (wrong key or corrupted frame)")]
    AuthenticationFailure,
    #[error("plaintext of {0} bytes does not fit the envelope")]
    Oversized(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("failed to read key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("shared key must be exactly 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Pre-shared ChaCha20-Poly1305 key. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey {
    bytes: [u8; KEY_LEN],
}

impl SharedKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Ok(Self { bytes })
    }

    /// Load a key file. Surrounding whitespace is trimmed and the remaining
    /// text is used verbatim as key material.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, KeyError> {
        let path = path.as_ref();
        let mut text = std::fs::read_to_string(path).map_err(|source| KeyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let key = Self::from_bytes(text.trim().as_bytes());
        text.zeroize();
        key
    }

    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint::compute_fingerprint(&self.bytes)
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.bytes))
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey")
            .field("fingerprint", &self.fingerprint().short())
            .finish()
    }
}

/// Seal `plaintext` into the wire envelope:
/// `[u32-LE length][12-byte nonce][16-byte tag][ciphertext]`.
///
/// Every call draws a fresh nonce from the OS CSPRNG.
pub fn encrypt(plaintext: &[u8], key: &SharedKey) -> Result<Vec<u8>, CipherError> {
    let declared =
        u32::try_from(plaintext.len()).map_err(|_| CipherError::Oversized(plaintext.len()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut packet = Vec::with_capacity(HEADER_LEN + plaintext.len());
    packet.extend_from_slice(&declared.to_le_bytes());
    packet.extend_from_slice(&nonce_bytes);
    packet.extend_from_slice(&[0u8; TAG_LEN]);
    packet.extend_from_slice(plaintext);

    // ChaCha20 is a stream cipher, so the ciphertext is written over the
    // plaintext in place and its length is unchanged.
    let tag = key
        .cipher()
        .encrypt_in_place_detached(nonce, b"", &mut packet[HEADER_LEN..])
        .map_err(|_| CipherError::Oversized(plaintext.len()))?;
    packet[LENGTH_LEN + NONCE_LEN..HEADER_LEN].copy_from_slice(&tag);

    Ok(packet)
}

/// Open a wire envelope produced by [`encrypt`].
///
/// Bytes past the declared ciphertext length are ignored.
pub fn decrypt(packet: &[u8], key: &SharedKey) -> Result<Vec<u8>, CipherError> {
    if packet.len() < HEADER_LEN {
        return Err(CipherError::Truncated {
            got: packet.len(),
            need: HEADER_LEN,
        });
    }

    let mut len_bytes = [0u8; LENGTH_LEN];
    len_bytes.copy_from_slice(&packet[..LENGTH_LEN]);
    let declared = u32::from_le_bytes(len_bytes) as usize;

    let need = HEADER_LEN.saturating_add(declared);
    if packet.len() < need {
        return Err(CipherError::Truncated {
            got: packet.len(),
            need,
        });
    }

    let nonce = Nonce::from_slice(&packet[LENGTH_LEN..LENGTH_LEN + NONCE_LEN]);
    let tag = Tag::from_slice(&packet[LENGTH_LEN + NONCE_LEN..HEADER_LEN]);
    let mut plaintext = packet[HEADER_LEN..need].to_vec();

    key.cipher()
        .decrypt_in_place_detached(nonce, b"", &mut plaintext, tag)
        .map_err(|_| CipherError::AuthenticationFailure)?;

    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SharedKey {
        SharedKey::from_bytes(b"0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn test_round_trip() {
        let key = test_key();
        let messages: [&[u8]; 4] = [b"", b"x", b"\xff\xd8\xff\xe0 jpeg bytes", &[7u8; 4096]];
        for message in messages {
            let packet = encrypt(message, &key).unwrap();
            assert_eq!(packet.len(), HEADER_LEN + message.len());
            assert_eq!(decrypt(&packet, &key).unwrap(), message);
        }
    }

    #[test]
    fn test_length_prefix_matches_ciphertext() {
        let key = test_key();
        let packet = encrypt(b"hello frame", &key).unwrap();
        let declared = u32::from_le_bytes(packet[..4].try_into().unwrap()) as usize;
        assert_eq!(declared, packet.len() - HEADER_LEN);
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = test_key();
        let a = encrypt(b"same plaintext", &key).unwrap();
        let b = encrypt(b"same plaintext", &key).unwrap();
        assert_ne!(a[4..16], b[4..16]);
        assert_ne!(a[HEADER_LEN..], b[HEADER_LEN..]);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let packet = encrypt(b"secret", &test_key()).unwrap();
        let other = SharedKey::from_bytes(&[9u8; 32]).unwrap();
        assert_eq!(decrypt(&packet, &other), Err(CipherError::AuthenticationFailure));
    }

    #[test]
    fn test_any_bit_flip_in_tag_or_ciphertext_is_rejected() {
        let key = test_key();
        let packet = encrypt(b"tamper evident payload", &key).unwrap();
        for byte in (LENGTH_LEN + NONCE_LEN)..packet.len() {
            for bit in 0..8 {
                let mut tampered = packet.clone();
                tampered[byte] ^= 1 << bit;
                assert_eq!(
                    decrypt(&tampered, &key),
                    Err(CipherError::AuthenticationFailure),
                    "flip at byte {} bit {}",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_short_input_is_truncated() {
        let key = test_key();
        for len in 0..HEADER_LEN {
            let input = vec![0xAAu8; len];
            assert!(matches!(
                decrypt(&input, &key),
                Err(CipherError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn test_declared_length_beyond_packet_is_truncated() {
        let key = test_key();
        let mut packet = encrypt(b"abc", &key).unwrap();
        packet[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decrypt(&packet, &key),
            Err(CipherError::Truncated { .. })
        ));

        let packet = encrypt(b"abcdef", &key).unwrap();
        assert!(matches!(
            decrypt(&packet[..packet.len() - 1], &key),
            Err(CipherError::Truncated { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let key = test_key();
        let mut packet = encrypt(b"frame", &key).unwrap();
        packet.extend_from_slice(b"garbage");
        assert_eq!(decrypt(&packet, &key).unwrap(), b"frame");
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(matches!(
            SharedKey::from_bytes(&[0u8; 31]),
            Err(KeyError::InvalidLength(31))
        ));
        assert!(SharedKey::from_bytes(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_load_key_file_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.txt");
        std::fs::write(&path, "  0123456789abcdef0123456789abcdef\n").unwrap();
        let key = SharedKey::load_from_file(&path).unwrap();
        assert_eq!(key.fingerprint().short(), test_key().fingerprint().short());

        std::fs::write(&path, "too-short\n").unwrap();
        assert!(matches!(
            SharedKey::load_from_file(&path),
            Err(KeyError::InvalidLength(9))
        ));

        assert!(matches!(
            SharedKey::load_from_file(dir.path().join("missing.txt")),
            Err(KeyError::Io { .. })
        ));
    }
}
