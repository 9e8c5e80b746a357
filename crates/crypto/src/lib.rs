use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

mod cipher;

pub use cipher::{SessionCipher, SESSION_KEY_LEN};

/// RSA modulus size used for every generated key pair.
pub const RSA_KEY_BITS: usize = 2048;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// RSA-2048 key pair, generated fresh per process and never persisted.
///
/// Covers both halves of the session crypto: wrapping/unwrapping AES session
/// keys (OAEP with SHA-256) and signing message payloads (PKCS#1 v1.5 with
/// SHA-256).
pub struct RsaKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl RsaKeyPair {
    pub fn generate() -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Our public key in PKCS#1 DER form, as announced to peers.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self
            .public_key
            .to_pkcs1_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .as_bytes()
            .to_vec())
    }

    /// Wrap an AES session key for a peer using their announced public key.
    pub fn encrypt_session_key(&self, session_key: &[u8], peer_public_der: &[u8]) -> Result<Vec<u8>> {
        let peer_key = RsaPublicKey::from_pkcs1_der(peer_public_der)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        peer_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), session_key)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))
    }

    /// Unwrap a session key that a peer encrypted against our public key.
    pub fn decrypt_session_key(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }

    /// Sign data with our private key. PKCS#1 v1.5 signing is deterministic,
    /// so identical input yields an identical signature.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        signing_key.sign(data).to_vec()
    }
}

/// Verify a signature against a claimed public key.
///
/// Any failure along the way - unparseable key, malformed signature bytes,
/// digest mismatch - yields `false` rather than an error, so a hostile peer
/// cannot abort the caller. Callers must drop messages that fail this check.
pub fn verify_signature(public_key_der: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let Ok(public_key) = RsaPublicKey::from_pkcs1_der(public_key_der) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    verifying_key.verify(data, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    // 2048-bit key generation dominates test runtime, so the suite shares
    // one pair of key pairs.
    fn keys() -> &'static (RsaKeyPair, RsaKeyPair) {
        static KEYS: OnceLock<(RsaKeyPair, RsaKeyPair)> = OnceLock::new();
        KEYS.get_or_init(|| {
            (
                RsaKeyPair::generate().unwrap(),
                RsaKeyPair::generate().unwrap(),
            )
        })
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let (alice, _) = keys();
        let data = b"attack at dawn";
        let signature = alice.sign(data);

        assert!(verify_signature(&alice.public_key_der().unwrap(), data, &signature));
    }

    #[test]
    fn test_verify_rejects_tampered_data_and_signature() {
        let (alice, _) = keys();
        let data = b"attack at dawn";
        let signature = alice.sign(data);
        let public_der = alice.public_key_der().unwrap();

        // Flip one bit in the data.
        let mut tampered = data.to_vec();
        tampered[0] ^= 0x01;
        assert!(!verify_signature(&public_der, &tampered, &signature));

        // Flip one bit in the signature.
        let mut bad_sig = signature.clone();
        bad_sig[0] ^= 0x01;
        assert!(!verify_signature(&public_der, data, &bad_sig));
    }

    #[test]
    fn test_verify_rejects_wrong_key_and_garbage_key() {
        let (alice, bob) = keys();
        let data = b"attack at dawn";
        let signature = alice.sign(data);

        assert!(!verify_signature(&bob.public_key_der().unwrap(), data, &signature));
        assert!(!verify_signature(b"not a der key", data, &signature));
    }

    #[test]
    fn test_session_key_wrap_round_trip() {
        let (alice, bob) = keys();
        let session_key = SessionCipher::generate_key();

        // Alice wraps for Bob; only Bob can unwrap.
        let wrapped = alice
            .encrypt_session_key(&session_key, &bob.public_key_der().unwrap())
            .unwrap();
        assert_ne!(wrapped.as_slice(), session_key.as_slice());

        let unwrapped = bob.decrypt_session_key(&wrapped).unwrap();
        assert_eq!(unwrapped.as_slice(), session_key.as_slice());

        assert!(alice.decrypt_session_key(&wrapped).is_err());
    }
}
