//! Cypher provider: turns cypher metadata plus resolved keys into usable
//! string cyphers and token signers.
//!
//! String cypher text is `base64(nonce || ciphertext || tag)` over the UTF-8
//! plaintext. Compact tokens are signed with the asymmetric key named by the
//! token-signature cypher; verification resolves only its public half.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::crypto::{self, SymmetricAlgorithm};
use crate::error::CypherError;
use crate::keys::{KeyMaterial, KeyProvider, KeyReference};
use crate::metadata::CypherMetaData;

/// Builds cyphers from metadata, resolving keys through a [`KeyProvider`].
pub struct CypherProvider {
    keys: Arc<dyn KeyProvider>,
}

impl CypherProvider {
    /// Create a provider resolving keys through `keys`.
    #[must_use]
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self { keys }
    }

    async fn resolve(&self, reference: &KeyReference) -> Result<Arc<KeyMaterial>, CypherError> {
        self.keys
            .resolve_key(reference)
            .await?
            .ok_or_else(|| CypherError::KeyNotFound {
                path: reference.path.clone(),
            })
    }

    /// A reversible string cypher for the given metadata.
    ///
    /// # Errors
    ///
    /// - [`CypherError::UnsupportedAlgorithm`] if the algorithm is not symmetric.
    /// - [`CypherError::KeyNotFound`] if the key does not exist.
    /// - [`CypherError::KeyResolution`] if the key is not a secret key of the right size.
    pub async fn cypher(&self, meta: &CypherMetaData) -> Result<StringCypher, CypherError> {
        let algorithm = SymmetricAlgorithm::parse(&meta.algorithm, meta.key_size)?;
        let material = self.resolve(&meta.key_reference()).await?;
        let len = material
            .secret_bytes()
            .map(<[u8]>::len)
            .ok_or_else(|| CypherError::KeyResolution {
                path: meta.key_path.clone(),
                reason: "not a secret key".to_owned(),
            })?;
        if len != algorithm.key_len() {
            return Err(CypherError::KeyResolution {
                path: meta.key_path.clone(),
                reason: format!(
                    "{} needs a {}-byte key, found {len}",
                    algorithm.name(),
                    algorithm.key_len()
                ),
            });
        }
        Ok(StringCypher {
            algorithm,
            material,
        })
    }

    /// A signer for compact tokens.
    ///
    /// # Errors
    ///
    /// Returns a [`CypherError`] if the algorithm is unsupported or the key is
    /// missing or not a signing pair.
    pub async fn signer(&self, meta: &CypherMetaData) -> Result<TokenSigner, CypherError> {
        let algorithm = signature_algorithm(&meta.algorithm)?;
        let material = self.resolve(&meta.key_reference()).await?;
        let der = material
            .private_der()
            .ok_or_else(|| CypherError::KeyResolution {
                path: meta.key_path.clone(),
                reason: "not a signing key".to_owned(),
            })?;
        Ok(TokenSigner {
            algorithm,
            key: EncodingKey::from_ed_der(der),
        })
    }

    /// A verifier for compact tokens, built from the public key only.
    ///
    /// # Errors
    ///
    /// Returns a [`CypherError`] if the algorithm is unsupported or the key is
    /// missing or has no public half.
    pub async fn verifier(&self, meta: &CypherMetaData) -> Result<TokenVerifier, CypherError> {
        let algorithm = signature_algorithm(&meta.algorithm)?;
        let material = self.resolve(&meta.public_key_reference()).await?;
        let public = material
            .public_key()
            .ok_or_else(|| CypherError::KeyResolution {
                path: meta.key_path.clone(),
                reason: "no public key".to_owned(),
            })?;
        Ok(TokenVerifier {
            algorithm,
            key: DecodingKey::from_ed_der(public),
        })
    }
}

impl fmt::Debug for CypherProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CypherProvider").finish_non_exhaustive()
    }
}

fn signature_algorithm(name: &str) -> Result<Algorithm, CypherError> {
    match name.to_ascii_uppercase().as_str() {
        "EDDSA" | "ED25519" => Ok(Algorithm::EdDSA),
        _ => Err(CypherError::UnsupportedAlgorithm {
            algorithm: name.to_owned(),
        }),
    }
}

/// A symmetric cypher over UTF-8 text.
pub struct StringCypher {
    algorithm: SymmetricAlgorithm,
    material: Arc<KeyMaterial>,
}

impl StringCypher {
    fn key(&self) -> Result<&[u8], CypherError> {
        self.material
            .secret_bytes()
            .ok_or_else(|| CypherError::KeyResolution {
                path: String::new(),
                reason: "not a secret key".to_owned(),
            })
    }

    /// Encrypt text into base64 cypher text.
    ///
    /// # Errors
    ///
    /// Returns [`CypherError::Encryption`] if the AEAD operation fails.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CypherError> {
        let sealed = crypto::encrypt(self.algorithm, self.key()?, plaintext.as_bytes())?;
        Ok(BASE64.encode(sealed))
    }

    /// Decrypt base64 cypher text produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// - [`CypherError::Encoding`] if the input is not base64 or the result not UTF-8.
    /// - [`CypherError::Decryption`] if authentication fails.
    pub fn decrypt(&self, text: &str) -> Result<String, CypherError> {
        let sealed = BASE64
            .decode(text.trim())
            .map_err(|e| CypherError::Encoding {
                reason: e.to_string(),
            })?;
        let plain = crypto::decrypt(self.algorithm, self.key()?, &sealed)?;
        String::from_utf8(plain).map_err(|e| CypherError::Encoding {
            reason: e.to_string(),
        })
    }

    /// The algorithm in use.
    #[must_use]
    pub fn algorithm(&self) -> SymmetricAlgorithm {
        self.algorithm
    }
}

impl fmt::Debug for StringCypher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringCypher")
            .field("algorithm", &self.algorithm)
            .field("key_version", &self.material.version())
            .finish_non_exhaustive()
    }
}

/// Signs claims into compact `header.payload.signature` tokens.
pub struct TokenSigner {
    algorithm: Algorithm,
    key: EncodingKey,
}

impl TokenSigner {
    /// Sign a claims object.
    ///
    /// # Errors
    ///
    /// Returns [`CypherError::Signature`] if serialization or signing fails.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, CypherError> {
        jsonwebtoken::encode(&Header::new(self.algorithm), claims, &self.key).map_err(|e| {
            CypherError::Signature {
                reason: e.to_string(),
            }
        })
    }
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Verifies compact tokens against a public key.
pub struct TokenVerifier {
    algorithm: Algorithm,
    key: DecodingKey,
}

impl TokenVerifier {
    /// A validation whitelisting exactly this verifier's algorithm.
    #[must_use]
    pub fn validation(&self) -> Validation {
        Validation::new(self.algorithm)
    }

    /// Verify a token and decode its claims.
    ///
    /// # Errors
    ///
    /// Returns the `jsonwebtoken` error so callers can tell expiry from
    /// signature failures.
    pub fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        validation: &Validation,
    ) -> Result<T, jsonwebtoken::errors::Error> {
        jsonwebtoken::decode::<T>(token, &self.key, validation).map(|data| data.claims)
    }
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
