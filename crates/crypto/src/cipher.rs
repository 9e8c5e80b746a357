use aes::cipher::{block_padding::Pkcs7, BlockModeDecrypt, BlockModeEncrypt, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::{CryptoError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-256 key length in bytes.
pub const SESSION_KEY_LEN: usize = 32;

const IV_LEN: usize = 16;

/// AES-256-CBC cipher bound to one negotiated session key.
///
/// Wire layout of every ciphertext: `[IV (16 bytes)][ciphertext]`, with a
/// fresh random IV per message and PKCS7 padding.
pub struct SessionCipher {
    key: [u8; SESSION_KEY_LEN],
}

impl SessionCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; SESSION_KEY_LEN] = key.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "AES-256 requires a {}-byte key, got {}",
                SESSION_KEY_LEN,
                key.len()
            ))
        })?;
        Ok(Self { key })
    }

    /// Generate a fresh random 256-bit session key.
    pub fn generate_key() -> [u8; SESSION_KEY_LEN] {
        let mut key = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }

    pub fn encrypt(&self, plaintext: &str) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec::<Pkcs7>(plaintext.as_bytes());

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<String> {
        if blob.len() <= IV_LEN || (blob.len() - IV_LEN) % 16 != 0 {
            return Err(CryptoError::Decrypt(format!(
                "ciphertext length {} is not a whole number of blocks after the IV",
                blob.len()
            )));
        }

        let (iv, ciphertext) = blob.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv.try_into().expect("split guarantees IV length");

        let plaintext = Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec::<Pkcs7>(ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}
