//! Payload protection: HMAC-SHA256 tags or AES-256-GCM encryption.
//!
//! When a namespace does not encrypt, every payload carries a trailing
//! 32-byte HMAC-SHA256 tag over the preceding bytes. When it does, the
//! payload is `nonce || ciphertext` and the AEAD tag provides integrity.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use spine_types::config::NamespaceConfig;
use spine_types::{SpineError, SpineResult};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Length of the HMAC-SHA256 tag appended to unencrypted payloads.
pub const TAG_LENGTH: usize = 32;

/// Length of the AES-GCM nonce prefixed to encrypted payloads.
pub const NONCE_LENGTH: usize = 12;

/// How payloads are protected within a namespace.
#[derive(Clone)]
pub enum Security {
    /// Append an HMAC tag; payloads travel in the clear.
    Hmac(HmacSha256),
    /// Encrypt with a key derived from the shared secret.
    Encrypted(Aes256Gcm),
}

impl std::fmt::Debug for Security {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Security::Hmac(_) => write!(f, "Security::Hmac(..)"),
            Security::Encrypted(_) => write!(f, "Security::Encrypted(..)"),
        }
    }
}

impl Security {
    /// HMAC-SHA256 keyed with `secret`.
    pub fn hmac(secret: &[u8]) -> SpineResult<Self> {
        let mac = <HmacSha256 as Mac>::new_from_slice(secret)
            .map_err(|e| SpineError::Config(format!("invalid HMAC key: {e}")))?;
        Ok(Security::Hmac(mac))
    }

    /// AES-256-GCM keyed with SHA-256(`secret`).
    pub fn encrypted(secret: &[u8]) -> SpineResult<Self> {
        let key = Sha256::digest(secret);
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| SpineError::Config(format!("invalid encryption key: {e}")))?;
        Ok(Security::Encrypted(cipher))
    }

    pub fn from_config(config: &NamespaceConfig) -> SpineResult<Self> {
        if config.use_encryption {
            Self::encrypted(config.shared_secret.as_bytes())
        } else {
            Self::hmac(config.shared_secret.as_bytes())
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Security::Encrypted(_))
    }

    /// Protect an outgoing payload.
    pub fn seal(&self, payload: &[u8]) -> SpineResult<Vec<u8>> {
        match self {
            Security::Hmac(mac) => {
                let tag = sign(mac, payload);
                let mut sealed = Vec::with_capacity(payload.len() + TAG_LENGTH);
                sealed.extend_from_slice(payload);
                sealed.extend_from_slice(&tag);
                Ok(sealed)
            }
            Security::Encrypted(cipher) => {
                let nonce_bytes: [u8; NONCE_LENGTH] = rand::random();
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce_bytes), payload)
                    .map_err(|_| SpineError::CorruptPayload("encryption failed".into()))?;
                let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
                sealed.extend_from_slice(&nonce_bytes);
                sealed.extend_from_slice(&ciphertext);
                Ok(sealed)
            }
        }
    }

    /// Verify and strip the protection from an incoming payload.
    ///
    /// Input too short to hold a tag or nonce is a
    /// [`SpineError::CorruptResponse`]; a wrong tag or failed decryption is
    /// an [`SpineError::AuthenticationFailure`].
    pub fn open(&self, sealed: &[u8]) -> SpineResult<Vec<u8>> {
        match self {
            Security::Hmac(mac) => {
                if sealed.len() < TAG_LENGTH {
                    return Err(SpineError::CorruptResponse(format!(
                        "{} bytes is shorter than the {TAG_LENGTH}-byte tag",
                        sealed.len()
                    )));
                }
                let (data, tag) = sealed.split_at(sealed.len() - TAG_LENGTH);
                let expected = sign(mac, data);
                if !bool::from(expected.as_slice().ct_eq(tag)) {
                    return Err(SpineError::AuthenticationFailure(
                        "HMAC mismatch".into(),
                    ));
                }
                Ok(data.to_vec())
            }
            Security::Encrypted(cipher) => {
                if sealed.len() < NONCE_LENGTH {
                    return Err(SpineError::CorruptResponse(format!(
                        "{} bytes is shorter than the {NONCE_LENGTH}-byte nonce",
                        sealed.len()
                    )));
                }
                let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
                cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext)
                    .map_err(|_| SpineError::AuthenticationFailure("decryption failed".into()))
            }
        }
    }
}

fn sign(mac: &HmacSha256, data: &[u8]) -> [u8; TAG_LENGTH] {
    let mut mac = mac.clone();
    mac.update(data);
    let mut tag = [0u8; TAG_LENGTH];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_appends_tag() {
        let security = Security::hmac(b"meow").unwrap();
        let sealed = security.seal(b"amir").unwrap();
        assert_eq!(sealed.len(), 4 + TAG_LENGTH);
        assert_eq!(&sealed[..4], b"amir");
        assert_eq!(security.open(&sealed).unwrap(), b"amir");
    }

    #[test]
    fn test_hmac_tag_is_deterministic() {
        let a = Security::hmac(b"meow").unwrap().seal(b"payload").unwrap();
        let b = Security::hmac(b"meow").unwrap().seal(b"payload").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hmac_rejects_tampering() {
        let security = Security::hmac(b"meow").unwrap();
        let mut sealed = security.seal(b"amir").unwrap();
        sealed[0] ^= 0x01;
        let err = security.open(&sealed).unwrap_err();
        assert!(err.is_authentication());

        let mut sealed = security.seal(b"amir").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;
        assert!(security.open(&sealed).unwrap_err().is_authentication());
    }

    #[test]
    fn test_hmac_rejects_other_key() {
        let sealed = Security::hmac(b"meow").unwrap().seal(b"amir").unwrap();
        let err = Security::hmac(b"woof").unwrap().open(&sealed).unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn test_short_input_is_corrupt_response() {
        let security = Security::hmac(b"meow").unwrap();
        let err = security.open(&[0u8; TAG_LENGTH - 1]).unwrap_err();
        assert!(matches!(err, SpineError::CorruptResponse(_)));

        // An empty payload still carries a full tag.
        let sealed = security.seal(b"").unwrap();
        assert_eq!(sealed.len(), TAG_LENGTH);
        assert!(security.open(&sealed).unwrap().is_empty());
    }

    #[test]
    fn test_encrypted_roundtrip_hides_plaintext() {
        let security = Security::encrypted(b"meow").unwrap();
        assert!(security.is_encrypted());
        let sealed = security.seal(b"secret plans").unwrap();
        assert!(!sealed.windows(6).any(|w| w == b"secret"));
        assert_eq!(security.open(&sealed).unwrap(), b"secret plans");
    }

    #[test]
    fn test_encrypted_rejects_tampering_and_wrong_key() {
        let security = Security::encrypted(b"meow").unwrap();
        let mut sealed = security.seal(b"amir").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(security.open(&sealed).unwrap_err().is_authentication());

        let sealed = security.seal(b"amir").unwrap();
        let other = Security::encrypted(b"woof").unwrap();
        assert!(other.open(&sealed).unwrap_err().is_authentication());

        let err = security.open(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, SpineError::CorruptResponse(_)));
    }

    #[test]
    fn test_from_config() {
        let mut config = NamespaceConfig {
            name: "lab".into(),
            shared_secret: "meow".into(),
            use_encryption: false,
        };
        assert!(!Security::from_config(&config).unwrap().is_encrypted());
        config.use_encryption = true;
        assert!(Security::from_config(&config).unwrap().is_encrypted());
    }
}
