//! Header obfuscation.
//!
//! Header bytes 0..9 (command and addresses) are XORed with a per-frame
//! mask drawn from a ChaCha20 keystream. The length field at bytes 9..11 is
//! left readable so the framing layer can size the payload. Each direction
//! of a connection owns its own keystream, which only moves forward, so a
//! mask is never reused within a connection. This hides traffic shape; it
//! is not payload encryption.

use crate::protocol::{Header, MASK_SIZE};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Nonce};
use sha2::{Digest, Sha256};

/// XOR `mask` into header bytes 0..9. Applying the same mask twice restores
/// the header.
pub fn apply_mask(header: &mut Header, mask: &[u8; MASK_SIZE]) {
    for (byte, m) in header.0[..MASK_SIZE].iter_mut().zip(mask) {
        *byte ^= m;
    }
}

/// Keystream state for one direction of a connection
pub struct Obfuscator {
    cipher: ChaCha20,
}

impl Obfuscator {
    /// Key is SHA-256 of the session key, nonce is all zeros.
    pub fn new(session_key: &[u8]) -> Self {
        let key = Sha256::digest(session_key);
        Self {
            cipher: ChaCha20::new(&key, &Nonce::default()),
        }
    }

    /// Draw the next 9 keystream bytes
    pub fn next_mask(&mut self) -> [u8; MASK_SIZE] {
        let mut mask = [0u8; MASK_SIZE];
        self.cipher.apply_keystream(&mut mask);
        mask
    }

    /// Mask (or unmask) a header with the next keystream bytes
    pub fn apply(&mut self, header: &mut Header) {
        let mask = self.next_mask();
        apply_mask(header, &mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Addr, CMD_OPEN_STREAM};
    use rand::{Rng, RngCore};

    fn random_header() -> Header {
        let mut header = Header::default();
        rand::thread_rng().fill_bytes(&mut header.0);
        header
    }

    #[test]
    fn test_mask_involution() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let original = random_header();
            let mut mask = [0u8; MASK_SIZE];
            rng.fill(&mut mask);

            let mut header = original;
            apply_mask(&mut header, &mask);
            assert_eq!(&header.0[9..], &original.0[9..]);

            apply_mask(&mut header, &mask);
            assert_eq!(header, original);
        }
    }

    #[test]
    fn test_peers_share_keystream() {
        let mut writer = Obfuscator::new(b"shared session key");
        let mut reader = Obfuscator::new(b"shared session key");

        let original = Header::new(CMD_OPEN_STREAM, Addr::new(3, 1024), Addr::new(9, 80));
        for _ in 0..8 {
            let mut header = original;
            writer.apply(&mut header);
            assert_eq!(header.field(), original.field());
            reader.apply(&mut header);
            assert_eq!(header, original);
        }
    }

    #[test]
    fn test_keystream_advances() {
        let mut obfuscator = Obfuscator::new(b"key");
        let first = obfuscator.next_mask();
        let second = obfuscator.next_mask();
        assert_ne!(first, second);

        let mut other = Obfuscator::new(b"other key");
        assert_ne!(other.next_mask(), first);
    }
}
