//! XXTEA Codec
//!
//! The eTRV encrypts every settings-service payload with XXTEA (Corrected
//! Block TEA) under a 16-byte symmetric key, and stores the bytes of each
//! 32-bit word in reversed order on the wire. [`Xxtea::encrypt`] and
//! [`Xxtea::decrypt`] apply the chunk reversal symmetrically around the
//! cipher so callers only ever see wire-format bytes.

use thiserror::Error;

/// Key size in bytes. Shorter configured keys are zero-padded.
pub const KEY_LEN: usize = 16;

const KEY_WORDS: usize = 4;
const MAX_DATA_WORDS: usize = 32;

/// Largest payload the codec will process (in bytes).
pub const MAX_DATA_LEN: usize = MAX_DATA_WORDS * 4;

const DELTA: u32 = 0x9e37_79b9;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material rejected before any cipher work was attempted.
    #[error("invalid cipher parameter: {0}")]
    ParameterError(&'static str),
    /// Payload length is not a positive multiple of 4, or exceeds the
    /// cipher's block capacity.
    #[error("payload length {0} outside cipher limits")]
    SizeError(usize),
    /// No key has been set yet (the device key has not been configured,
    /// loaded or learned).
    #[error("encryption key not set")]
    KeyNotSet,
}

/// XXTEA block cipher with the eTRV's word-reversal wire framing.
#[derive(Debug, Clone, Default)]
pub struct Xxtea {
    key: Option<[u32; KEY_WORDS]>,
}

impl Xxtea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: &[u8]) -> Result<Self, CryptoError> {
        let mut codec = Self::new();
        codec.set_key(key)?;
        Ok(codec)
    }

    pub fn is_keyed(&self) -> bool {
        self.key.is_some()
    }

    /// Validate and store the key. Keys shorter than [`KEY_LEN`] are
    /// zero-padded, matching the device firmware.
    pub fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError> {
        if key.is_empty() || key.len() > KEY_LEN {
            return Err(CryptoError::ParameterError("key must be 1..=16 bytes"));
        }
        if key.len().div_ceil(4) > KEY_WORDS {
            return Err(CryptoError::SizeError(key.len()));
        }

        let mut padded = [0u8; KEY_LEN];
        padded[..key.len()].copy_from_slice(key);

        let mut words = [0u32; KEY_WORDS];
        for (word, chunk) in words.iter_mut().zip(padded.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        self.key = Some(words);
        Ok(())
    }

    /// Encrypt a wire payload: reverse each 4-byte chunk, run the cipher,
    /// reverse the cipher output chunks again.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.key.ok_or(CryptoError::KeyNotSet)?;
        check_payload_len(plaintext.len())?;

        let mut words = bytes_to_words(&reverse_chunks(plaintext));
        btea_encrypt(&mut words, &key);
        Ok(reverse_chunks(&words_to_bytes(&words)))
    }

    /// Inverse of [`Xxtea::encrypt`], same size constraints.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.key.ok_or(CryptoError::KeyNotSet)?;
        check_payload_len(ciphertext.len())?;

        let mut words = bytes_to_words(&reverse_chunks(ciphertext));
        btea_decrypt(&mut words, &key);
        Ok(reverse_chunks(&words_to_bytes(&words)))
    }
}

/// Reverse the bytes within each 4-byte chunk; a shorter tail chunk is
/// reversed in place the same way. Applying it twice restores the input.
pub fn reverse_chunks(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(4) {
        out.extend(chunk.iter().rev());
    }
    out
}

fn check_payload_len(len: usize) -> Result<(), CryptoError> {
    if len == 0 || len % 4 != 0 || len > MAX_DATA_LEN {
        return Err(CryptoError::SizeError(len));
    }
    Ok(())
}

fn bytes_to_words(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

fn mx(sum: u32, y: u32, z: u32, p: usize, e: u32, key: &[u32; KEY_WORDS]) -> u32 {
    (((z >> 5) ^ (y << 2)).wrapping_add((y >> 3) ^ (z << 4)))
        ^ ((sum ^ y).wrapping_add(key[(p & 3) ^ e as usize] ^ z))
}

// Corrected Block TEA; a single-word block passes through unchanged.
fn btea_encrypt(v: &mut [u32], key: &[u32; KEY_WORDS]) {
    let n = v.len();
    if n < 2 {
        return;
    }

    let rounds = 6 + 52 / n;
    let mut sum: u32 = 0;
    let mut z = v[n - 1];
    for _ in 0..rounds {
        sum = sum.wrapping_add(DELTA);
        let e = (sum >> 2) & 3;
        for p in 0..n {
            let y = v[(p + 1) % n];
            v[p] = v[p].wrapping_add(mx(sum, y, z, p, e, key));
            z = v[p];
        }
    }
}

fn btea_decrypt(v: &mut [u32], key: &[u32; KEY_WORDS]) {
    let n = v.len();
    if n < 2 {
        return;
    }

    let rounds = 6 + 52 / n;
    let mut sum = (rounds as u32).wrapping_mul(DELTA);
    let mut y = v[0];
    for _ in 0..rounds {
        let e = (sum >> 2) & 3;
        for p in (0..n).rev() {
            let z = v[(p + n - 1) % n];
            v[p] = v[p].wrapping_sub(mx(sum, y, z, p, e, key));
            y = v[p];
        }
        sum = sum.wrapping_sub(DELTA);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];

    #[test]
    fn test_reverse_chunks_involution() {
        for len in 0..=13 {
            let data: Vec<u8> = (0..len as u8).collect();
            assert_eq!(reverse_chunks(&reverse_chunks(&data)), data);
        }
    }

    #[test]
    fn test_reverse_chunks_tail() {
        assert_eq!(
            reverse_chunks(&[1, 2, 3, 4, 5, 6]),
            vec![4, 3, 2, 1, 6, 5]
        );
        assert_eq!(reverse_chunks(&[1, 2, 3, 4]), vec![4, 3, 2, 1]);
        assert_eq!(reverse_chunks(&[9]), vec![9]);
    }

    #[test]
    fn test_round_trip() {
        let codec = Xxtea::with_key(&KEY).unwrap();
        for len in [4usize, 8, 16, 32, MAX_DATA_LEN] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let ciphertext = codec.encrypt(&payload).unwrap();
            assert_eq!(ciphertext.len(), payload.len());
            assert_eq!(codec.decrypt(&ciphertext).unwrap(), payload);
        }
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let codec = Xxtea::with_key(&KEY).unwrap();
        let payload = [0u8; 16];
        assert_ne!(codec.encrypt(&payload).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_different_keys_disagree() {
        let a = Xxtea::with_key(&KEY).unwrap();
        let b = Xxtea::with_key(&[0x01; 16]).unwrap();
        let payload = [0x42u8; 8];
        assert_ne!(a.encrypt(&payload).unwrap(), b.encrypt(&payload).unwrap());
    }

    #[test]
    fn test_short_key_is_padded() {
        let short = Xxtea::with_key(&KEY[..10]).unwrap();
        let mut padded_key = [0u8; 16];
        padded_key[..10].copy_from_slice(&KEY[..10]);
        let padded = Xxtea::with_key(&padded_key).unwrap();

        let payload = [0x13u8; 8];
        assert_eq!(
            short.encrypt(&payload).unwrap(),
            padded.encrypt(&payload).unwrap()
        );
    }

    #[test]
    fn test_size_errors() {
        let codec = Xxtea::with_key(&KEY).unwrap();
        assert_eq!(codec.encrypt(&[]), Err(CryptoError::SizeError(0)));
        assert_eq!(codec.encrypt(&[0; 3]), Err(CryptoError::SizeError(3)));
        assert_eq!(codec.decrypt(&[0; 5]), Err(CryptoError::SizeError(5)));
        assert_eq!(
            codec.encrypt(&vec![0; MAX_DATA_LEN + 4]),
            Err(CryptoError::SizeError(MAX_DATA_LEN + 4))
        );
    }

    #[test]
    fn test_key_errors() {
        let mut codec = Xxtea::new();
        assert!(matches!(
            codec.set_key(&[]),
            Err(CryptoError::ParameterError(_))
        ));
        assert!(matches!(
            codec.set_key(&[0; 17]),
            Err(CryptoError::ParameterError(_))
        ));
        assert!(!codec.is_keyed());

        codec.set_key(&KEY).unwrap();
        assert!(codec.is_keyed());
    }

    #[test]
    fn test_unkeyed_codec_refuses() {
        let codec = Xxtea::new();
        assert_eq!(codec.encrypt(&[0; 8]), Err(CryptoError::KeyNotSet));
        assert_eq!(codec.decrypt(&[0; 8]), Err(CryptoError::KeyNotSet));
    }
}
