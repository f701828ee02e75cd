//! Secure channel cipher.
//!
//! Commands sent to the bootloader are wrapped in AES-128-CBC. The IV is not
//! reset between commands: every encryption continues the chain from the last
//! ciphertext block it produced, and every decryption continues from the last
//! ciphertext block it consumed. Host and device therefore stay in lockstep
//! only while every command is processed in order, so a channel must be owned
//! by exactly one session and discarded after any failure.
//!
//! Padding is ISO/IEC 7816-4 style: a 0x80 marker followed by zero bytes up to
//! the next block boundary. The marker is always present, so block-aligned
//! input still gains a full padding block.

use std::fmt;

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use thiserror::Error;

/// AES block size.
pub const BLOCK_SIZE: usize = 16;

/// AES-128 key length.
pub const KEY_SIZE: usize = 16;

/// First byte of the padding appended to every plaintext.
pub const PADDING_MARKER: u8 = 0x80;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Secure channel ciphertext is {len} bytes, not a whole number of blocks")]
    Misaligned { len: usize },

    #[error("Secure channel padding corrupt")]
    PaddingCorrupt,

    #[error("Invalid secure channel key: {0}")]
    InvalidKey(String),
}

/// Chained AES-128-CBC state for one loader session.
pub struct SecureChannel {
    /// `None` when the channel is disabled.
    cipher: Option<Aes128>,
    iv: [u8; BLOCK_SIZE],
}

impl SecureChannel {
    /// A pass-through channel: commands travel in clear.
    pub fn disabled() -> Self {
        Self {
            cipher: None,
            iv: [0; BLOCK_SIZE],
        }
    }

    /// Enabled channel with the bootloader's initial all-zero IV.
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self::with_iv(key, [0; BLOCK_SIZE])
    }

    /// Enabled channel resuming from a known IV.
    pub fn with_iv(key: &[u8; KEY_SIZE], iv: [u8; BLOCK_SIZE]) -> Self {
        Self {
            cipher: Some(Aes128::new(key.into())),
            iv,
        }
    }

    /// Parse a key given as 32 hex characters.
    pub fn from_hex_key(key: &str) -> Result<Self, ChannelError> {
        let bytes = hex::decode(key.trim()).map_err(|e| ChannelError::InvalidKey(e.to_string()))?;
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            ChannelError::InvalidKey(format!("expected {KEY_SIZE} bytes, got {}", v.len()))
        })?;
        Ok(Self::new(&key))
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Current chaining value.
    pub fn iv(&self) -> &[u8; BLOCK_SIZE] {
        &self.iv
    }

    /// Pad and encrypt `plaintext`, chaining the IV on the produced ciphertext.
    ///
    /// Identity when the channel is disabled.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let Some(cipher) = &self.cipher else {
            return plaintext.to_vec();
        };

        let mut buf = Vec::with_capacity(padded_len(plaintext.len()));
        buf.extend_from_slice(plaintext);
        buf.push(PADDING_MARKER);
        buf.resize(buf.len().next_multiple_of(BLOCK_SIZE), 0x00);

        let mut chain = self.iv;
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            xor_in_place(block, &chain);
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
            chain.copy_from_slice(block);
        }

        self.iv = chain;
        buf
    }

    /// Decrypt `ciphertext` and strip its padding, chaining the IV on the
    /// consumed ciphertext.
    ///
    /// Identity when the channel is disabled or the input is empty. The IV is
    /// left untouched when decryption fails.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let Some(cipher) = &self.cipher else {
            return Ok(ciphertext.to_vec());
        };
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(ChannelError::Misaligned {
                len: ciphertext.len(),
            });
        }

        let mut buf = ciphertext.to_vec();
        let mut chain = self.iv;
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            let mut next = [0u8; BLOCK_SIZE];
            next.copy_from_slice(block);
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
            xor_in_place(block, &chain);
            chain = next;
        }

        let end = padding_start(&buf)?;
        buf.truncate(end);
        self.iv = chain;
        Ok(buf)
    }
}

impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("enabled", &self.is_enabled())
            .field("iv", &hex::encode(self.iv))
            .finish()
    }
}

/// Length of `len` plaintext bytes once padded.
pub fn padded_len(len: usize) -> usize {
    (len + 1).next_multiple_of(BLOCK_SIZE)
}

fn xor_in_place(block: &mut [u8], chain: &[u8; BLOCK_SIZE]) {
    for (b, c) in block.iter_mut().zip(chain) {
        *b ^= c;
    }
}

/// Locate the last padding marker within the final block.
///
/// Bytes after the marker are discarded whatever their value.
fn padding_start(buf: &[u8]) -> Result<usize, ChannelError> {
    let window = buf.len().saturating_sub(BLOCK_SIZE);
    buf[window..]
        .iter()
        .rposition(|&b| b == PADDING_MARKER)
        .map(|i| window + i)
        .ok_or(ChannelError::PaddingCorrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_SIZE] {
        core::array::from_fn(|i| i as u8)
    }

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_padded_len() {
        assert_eq!(padded_len(0), 16);
        assert_eq!(padded_len(15), 16);
        assert_eq!(padded_len(16), 32);
        assert_eq!(padded_len(239), 240);
    }

    #[test]
    fn test_disabled_is_identity() {
        let mut channel = SecureChannel::disabled();
        assert!(!channel.is_enabled());
        assert_eq!(channel.encrypt(b"\x05\x00\x00\x10\x00"), b"\x05\x00\x00\x10\x00");
        assert_eq!(channel.decrypt(b"abc").unwrap(), b"abc");
        assert_eq!(channel.iv(), &[0u8; BLOCK_SIZE]);
    }

    #[test]
    fn test_iv_chain_regression() {
        let mut channel = SecureChannel::new(&test_key());

        let c1 = channel.encrypt(&[0x05, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(c1, unhex("24f8aa8ca983638c3029dc125b3a64cc"));
        assert_eq!(&channel.iv()[..], &c1[..]);

        let c2 = channel.encrypt(&[0x07]);
        assert_eq!(c2, unhex("300f656a53b29b2c685c48b1e3eaa690"));

        let block: Vec<u8> = (0u8..16).collect();
        let c3 = channel.encrypt(&block);
        assert_eq!(c3.len(), 32);
        assert_eq!(
            c3,
            unhex("26514a4c1271331861b368c1d91f250d504f4545c8efccb9f16206679d848560")
        );
        assert_eq!(
            &channel.iv()[..],
            &unhex("504f4545c8efccb9f16206679d848560")[..]
        );
    }

    #[test]
    fn test_decrypt_chains_on_input() {
        let iv: [u8; BLOCK_SIZE] = unhex("504f4545c8efccb9f16206679d848560")
            .try_into()
            .unwrap();
        let mut channel = SecureChannel::with_iv(&test_key(), iv);
        let ciphertext = unhex(concat!(
            "4e1d414649fcf56e8958e290c6d4ea51",
            "9c6a6022ff4e88862c0287d7d21a79ef",
            "4cc50a949013b4cb50a27f0fc44de001"
        ));

        let plaintext = channel.decrypt(&ciphertext).unwrap();

        let mut expected = b"\x01\x03abc\x00\x00\x00\x01".to_vec();
        expected.extend_from_slice(&[0xAA; 32]);
        assert_eq!(plaintext, expected);
        assert_eq!(&channel.iv()[..], &ciphertext[32..]);
    }

    #[test]
    fn test_paired_channels_roundtrip() {
        let mut host = SecureChannel::new(&test_key());
        let mut device = SecureChannel::new(&test_key());

        for len in 0..=64usize {
            let plaintext: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
            let ciphertext = host.encrypt(&plaintext);
            assert_eq!(ciphertext.len(), padded_len(len));
            assert_eq!(device.decrypt(&ciphertext).unwrap(), plaintext);
            assert_eq!(host.iv(), device.iv());
        }
    }

    #[test]
    fn test_trailing_marker_in_payload_survives() {
        let mut host = SecureChannel::new(&test_key());
        let mut device = SecureChannel::new(&test_key());
        let plaintext = [0x12, 0x80, 0x00, 0x00];
        let ciphertext = host.encrypt(&plaintext);
        assert_eq!(device.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_marker_cut_ignores_trailing_bytes() {
        let mut plain = [0u8; BLOCK_SIZE];
        plain[..3].copy_from_slice(&[0xAB, PADDING_MARKER, 0x01]);
        // First CBC block under a zero IV is a bare block encryption.
        let cipher = Aes128::new(GenericArray::from_slice(&test_key()));
        let mut block = GenericArray::clone_from_slice(&plain);
        cipher.encrypt_block(&mut block);

        let mut device = SecureChannel::new(&test_key());
        assert_eq!(device.decrypt(&block).unwrap(), vec![0xAB]);
        assert_eq!(&device.iv()[..], &block[..]);
    }

    #[test]
    fn test_decrypt_empty_keeps_iv() {
        let mut channel = SecureChannel::new(&test_key());
        assert!(channel.decrypt(&[]).unwrap().is_empty());
        assert_eq!(channel.iv(), &[0u8; BLOCK_SIZE]);
    }

    #[test]
    fn test_decrypt_misaligned() {
        let mut channel = SecureChannel::new(&test_key());
        assert_eq!(
            channel.decrypt(&[0u8; 17]),
            Err(ChannelError::Misaligned { len: 17 })
        );
    }

    #[test]
    fn test_decrypt_missing_marker() {
        let mut host = SecureChannel::new(&test_key());
        // The first block of a two-block ciphertext carries no padding.
        let ciphertext = host.encrypt(&[0x11; BLOCK_SIZE]);

        let mut device = SecureChannel::new(&test_key());
        assert_eq!(
            device.decrypt(&ciphertext[..BLOCK_SIZE]),
            Err(ChannelError::PaddingCorrupt)
        );
        assert_eq!(device.iv(), &[0u8; BLOCK_SIZE]);
    }

    #[test]
    fn test_from_hex_key() {
        let channel = SecureChannel::from_hex_key("000102030405060708090a0b0c0d0e0f").unwrap();
        assert!(channel.is_enabled());
        assert!(matches!(
            SecureChannel::from_hex_key("0001"),
            Err(ChannelError::InvalidKey(_))
        ));
        assert!(matches!(
            SecureChannel::from_hex_key("zz"),
            Err(ChannelError::InvalidKey(_))
        ));
    }
}
