use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key size")]
    InvalidKeySize,
    #[error("authentication tag mismatch")]
    InvalidTag,
}

pub fn hmac_sha256(key: &[u8], input: &[u8]) -> [u8; 32] {
    let mut hmac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .expect("HMAC-SHA256 should accept any size key");
    hmac.update(input);
    hmac.finalize().into_bytes().into()
}

/// HKDF-SHA256 filling `okm` completely.
pub fn hkdf_sha256(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], okm: &mut [u8]) {
    hkdf::Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, okm)
        .expect("valid output length");
}

pub fn sha256(input: &[u8]) -> [u8; 32] {
    Sha256::digest(input).into()
}

pub fn aes_256_gcm_encrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeySize)?;
    cipher
        .encrypt(
            aes_gcm::Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::InvalidTag)
}

pub fn aes_256_gcm_decrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::InvalidTag);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeySize)?;
    cipher
        .decrypt(
            aes_gcm::Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::InvalidTag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcm_roundtrip_and_aad_binding() {
        let key = [7u8; 32];
        let nonce = [1u8; NONCE_SIZE];
        let ct = aes_256_gcm_encrypt(&key, &nonce, b"hi there", b"ad").unwrap();
        assert_eq!(ct.len(), 8 + TAG_SIZE);

        assert_eq!(
            aes_256_gcm_decrypt(&key, &nonce, &ct, b"ad").unwrap(),
            b"hi there"
        );
        assert_eq!(
            aes_256_gcm_decrypt(&key, &nonce, &ct, b"other"),
            Err(CryptoError::InvalidTag)
        );
        assert_eq!(
            aes_256_gcm_decrypt(&key, &nonce, &ct[..4], b"ad"),
            Err(CryptoError::InvalidTag)
        );
    }

    #[test]
    fn hmac_matches_rfc4231_case_2() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
