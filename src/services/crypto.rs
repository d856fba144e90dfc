use base64::{engine::general_purpose, Engine as _};
use ring::{aead, pbkdf2, rand::{SecureRandom, SystemRandom}};
use std::num::NonZeroU32;

use crate::error::StoreError;

const KEY_SALT: &[u8] = b"faturas-sync-token-v1";
const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const PREFIX: &str = "enc:v1";

/// Encrypts OAuth tokens before they reach the credentials table.
///
/// The key is derived once from the configured secret; each payload carries its own nonce
/// as `enc:v1:<nonce>:<ciphertext>`, both base64.
#[derive(Clone)]
pub struct TokenCipher {
    key_bytes: [u8; 32],
}

impl TokenCipher {
    pub fn new(secret: &str) -> Result<Self, StoreError> {
        if secret.is_empty() {
            return Err(StoreError::Cipher("empty token secret".to_string()));
        }
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
            .ok_or_else(|| StoreError::Cipher("invalid iterations".to_string()))?;
        let mut key_bytes = [0u8; 32];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            KEY_SALT,
            secret.as_bytes(),
            &mut key_bytes,
        );
        Ok(TokenCipher { key_bytes })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, StoreError> {
        let rng = SystemRandom::new();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes)
            .map_err(|_| StoreError::Cipher("failed to generate nonce".to_string()))?;

        let key = self.key()?;
        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);
        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
            .map_err(|_| StoreError::Cipher("encryption failed".to_string()))?;

        Ok(format!(
            "{}:{}:{}",
            PREFIX,
            general_purpose::STANDARD.encode(nonce_bytes),
            general_purpose::STANDARD.encode(in_out)
        ))
    }

    pub fn decrypt(&self, payload: &str) -> Result<String, StoreError> {
        let rest = payload
            .strip_prefix(PREFIX)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| StoreError::Cipher("unknown encrypted format".to_string()))?;
        let (nonce_part, data_part) = rest
            .split_once(':')
            .ok_or_else(|| StoreError::Cipher("invalid encrypted payload".to_string()))?;

        let nonce_bytes = general_purpose::STANDARD
            .decode(nonce_part)
            .map_err(|e| StoreError::Cipher(format!("decode nonce: {}", e)))?;
        let mut data = general_purpose::STANDARD
            .decode(data_part)
            .map_err(|e| StoreError::Cipher(format!("decode ciphertext: {}", e)))?;

        let nonce = aead::Nonce::assume_unique_for_key(
            nonce_bytes
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Cipher("invalid nonce length".to_string()))?,
        );
        let key = self.key()?;
        let decrypted = key
            .open_in_place(nonce, aead::Aad::empty(), &mut data)
            .map_err(|_| StoreError::Cipher("decryption failed".to_string()))?;
        String::from_utf8(decrypted.to_vec()).map_err(|e| StoreError::Cipher(e.to_string()))
    }

    fn key(&self) -> Result<aead::LessSafeKey, StoreError> {
        let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &self.key_bytes)
            .map_err(|_| StoreError::Cipher("invalid key material".to_string()))?;
        Ok(aead::LessSafeKey::new(unbound))
    }
}
