//! Cryptographic primitives for Coffer.
//!
//! Provides AES-GCM authenticated encryption (128 and 256 bit keys),
//! Argon2id password hashing and password-based key derivation, and a
//! zeroize-on-drop key newtype. All key material is cleared from memory
//! when dropped.
//!
//! # Security model
//!
//! - Every encryption generates a fresh 96-bit nonce via `OsRng`.
//! - Ciphertext format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! - Password hashes are Argon2id PHC strings; verification reads the cost
//!   parameters from the hash itself.
//! - Key-store wrapping keys are derived with Argon2id over a random salt.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, Nonce, OsRng};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CypherError;

/// Nonce length for AES-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// Minimum ciphertext length: 12-byte nonce + 16-byte AES-GCM tag.
const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + 16;

/// A symmetric AEAD algorithm usable as a string cypher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymmetricAlgorithm {
    /// AES-GCM with a 128-bit key.
    Aes128Gcm,
    /// AES-GCM with a 256-bit key.
    Aes256Gcm,
}

impl SymmetricAlgorithm {
    /// Resolve an algorithm name. Bare `AES` names pick the variant from
    /// `key_size` (in bits).
    ///
    /// # Errors
    ///
    /// Returns [`CypherError::UnsupportedAlgorithm`] for anything that is not
    /// an AES-GCM variant.
    pub fn parse(name: &str, key_size: u32) -> Result<Self, CypherError> {
        match name.to_ascii_uppercase().as_str() {
            "AES-256-GCM" | "A256GCM" => Ok(Self::Aes256Gcm),
            "AES-128-GCM" | "A128GCM" => Ok(Self::Aes128Gcm),
            "AES" | "AES-GCM" | "AES/GCM/NOPADDING" => match key_size {
                128 => Ok(Self::Aes128Gcm),
                256 => Ok(Self::Aes256Gcm),
                _ => Err(CypherError::UnsupportedAlgorithm {
                    algorithm: format!("{name} with {key_size}-bit key"),
                }),
            },
            _ => Err(CypherError::UnsupportedAlgorithm {
                algorithm: name.to_owned(),
            }),
        }
    }

    /// Required key length in bytes.
    #[must_use]
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes256Gcm => 32,
        }
    }

    /// Canonical name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Aes128Gcm => "AES-128-GCM",
            Self::Aes256Gcm => "AES-256-GCM",
        }
    }
}

/// A 256-bit wrapping key that is zeroized on drop.
///
/// Used to seal key-store entries. The inner bytes are never exposed in
/// `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// Use with care: the caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

impl KdfParams {
    fn argon2(&self) -> Result<Argon2<'static>, CypherError> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, None)
            .map_err(|e| CypherError::KeyDerivation {
                reason: format!("invalid Argon2 params: {e}"),
            })?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Fill a fresh buffer with `len` random bytes from the OS CSPRNG.
#[must_use]
pub fn random_bytes(len: usize) -> Zeroizing<Vec<u8>> {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

fn seal<C>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CypherError>
where
    C: KeyInit + Aead + AeadCore,
{
    let cipher = C::new_from_slice(key).map_err(|e| CypherError::Encryption {
        reason: e.to_string(),
    })?;
    let nonce = C::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CypherError::Encryption {
            reason: e.to_string(),
        })?;

    // nonce || ciphertext (includes tag appended by aes-gcm)
    let mut combined = Vec::with_capacity(NONCE_LEN.saturating_add(ciphertext.len()));
    combined.extend_from_slice(&nonce);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

fn open<C>(key: &[u8], combined: &[u8]) -> Result<Vec<u8>, CypherError>
where
    C: KeyInit + Aead + AeadCore,
{
    if combined.len() < MIN_CIPHERTEXT_LEN {
        return Err(CypherError::CiphertextTooShort {
            expected: MIN_CIPHERTEXT_LEN,
            actual: combined.len(),
        });
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let cipher = C::new_from_slice(key).map_err(|e| CypherError::Decryption {
        reason: e.to_string(),
    })?;
    cipher
        .decrypt(Nonce::<C>::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| CypherError::Decryption {
            reason: e.to_string(),
        })
}

/// Encrypt plaintext with a fresh random nonce.
///
/// Returns `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
///
/// # Errors
///
/// Returns [`CypherError::Encryption`] if the key has the wrong length or
/// the AEAD operation fails.
pub fn encrypt(
    algorithm: SymmetricAlgorithm,
    key: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CypherError> {
    match algorithm {
        SymmetricAlgorithm::Aes128Gcm => seal::<Aes128Gcm>(key, plaintext),
        SymmetricAlgorithm::Aes256Gcm => seal::<Aes256Gcm>(key, plaintext),
    }
}

/// Decrypt ciphertext produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`CypherError::CiphertextTooShort`] if the input is shorter than
/// 28 bytes (nonce + tag minimum).
///
/// Returns [`CypherError::Decryption`] if authentication fails (wrong key,
/// corrupted data, or tampered tag).
pub fn decrypt(
    algorithm: SymmetricAlgorithm,
    key: &[u8],
    combined: &[u8],
) -> Result<Vec<u8>, CypherError> {
    match algorithm {
        SymmetricAlgorithm::Aes128Gcm => open::<Aes128Gcm>(key, combined),
        SymmetricAlgorithm::Aes256Gcm => open::<Aes256Gcm>(key, combined),
    }
}

/// Derive a 256-bit wrapping key from a password with Argon2id.
///
/// # Errors
///
/// Returns [`CypherError::KeyDerivation`] if the parameters are invalid or
/// the salt is shorter than 8 bytes.
pub fn derive_key_from_password(
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<EncryptionKey, CypherError> {
    let mut derived = [0u8; 32];
    params
        .argon2()?
        .hash_password_into(password, salt, &mut derived)
        .map_err(|e| CypherError::KeyDerivation {
            reason: e.to_string(),
        })?;
    let key = EncryptionKey::from_bytes(derived);
    derived.zeroize();
    Ok(key)
}

/// Hash a password into an Argon2id PHC string with the given cost.
///
/// # Errors
///
/// Returns [`CypherError::KeyDerivation`] if hashing fails.
pub fn hash_password_with(password: &str, params: &KdfParams) -> Result<String, CypherError> {
    let salt = SaltString::generate(&mut OsRng);
    params
        .argon2()?
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CypherError::KeyDerivation {
            reason: e.to_string(),
        })
}

/// Hash a password into an Argon2id PHC string with default cost.
///
/// # Errors
///
/// Returns [`CypherError::KeyDerivation`] if hashing fails.
pub fn hash_password(password: &str) -> Result<String, CypherError> {
    hash_password_with(password, &KdfParams::default())
}

/// Verify a password against a PHC string. A malformed hash never verifies.
#[must_use]
pub fn verify_password(password: &str, phc: &str) -> bool {
    PasswordHash::new(phc).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;

    /// Cheap Argon2 parameters for tests only.
    pub(crate) const FAST_KDF: KdfParams = KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };

    #[test]
    fn encrypt_decrypt_roundtrip_both_key_sizes() {
        for algorithm in [SymmetricAlgorithm::Aes128Gcm, SymmetricAlgorithm::Aes256Gcm] {
            let key = random_bytes(algorithm.key_len());
            let ciphertext = encrypt(algorithm, &key, b"secret data for coffer").unwrap();
            let decrypted = decrypt(algorithm, &key, &ciphertext).unwrap();
            assert_eq!(decrypted, b"secret data for coffer");
        }
    }

    #[test]
    fn decrypt_wrong_key_fails() {
        let alg = SymmetricAlgorithm::Aes256Gcm;
        let ciphertext = encrypt(alg, &random_bytes(32), b"secret").unwrap();
        let result = decrypt(alg, &random_bytes(32), &ciphertext);
        assert!(matches!(result, Err(CypherError::Decryption { .. })));
    }

    #[test]
    fn decrypt_too_short_fails() {
        let result = decrypt(SymmetricAlgorithm::Aes256Gcm, &random_bytes(32), &[0u8; 10]);
        assert!(matches!(
            result,
            Err(CypherError::CiphertextTooShort {
                expected: 28,
                actual: 10
            })
        ));
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        let result = encrypt(SymmetricAlgorithm::Aes256Gcm, &random_bytes(16), b"x");
        assert!(matches!(result, Err(CypherError::Encryption { .. })));
    }

    #[test]
    fn parse_algorithm_names() {
        assert_eq!(
            SymmetricAlgorithm::parse("AES-256-GCM", 0).unwrap(),
            SymmetricAlgorithm::Aes256Gcm
        );
        assert_eq!(
            SymmetricAlgorithm::parse("aes", 128).unwrap(),
            SymmetricAlgorithm::Aes128Gcm
        );
        assert!(SymmetricAlgorithm::parse("AES", 192).is_err());
        assert!(SymmetricAlgorithm::parse("EdDSA", 256).is_err());
    }

    #[test]
    fn password_derivation_is_deterministic_per_salt() {
        let a = derive_key_from_password(b"pw", b"saltsalt", &FAST_KDF).unwrap();
        let b = derive_key_from_password(b"pw", b"saltsalt", &FAST_KDF).unwrap();
        let c = derive_key_from_password(b"pw", b"othersalt", &FAST_KDF).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password_with("correct horse", &FAST_KDF).unwrap();
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("correct horse", "not-a-phc-string"));
    }

    #[test]
    fn debug_redacts_key() {
        let key = EncryptionKey::generate();
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
