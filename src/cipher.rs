//! Field cipher and the encrypted-value envelope.
//!
//! An [`EncryptedValue`] is self-describing: it names the key version and
//! algorithm that produced it, so a value written before a rotation still
//! decrypts afterwards. Inside payload trees it travels as a compact string
//! token, `$fg1$` followed by the base64url-encoded JSON envelope.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::classification::ClassificationEntry;
use crate::error::{Error, ErrorKind, Result};
use crate::key::{KeyManager, KeyVersion, KeyVersionId, SealedPayload};
use crate::secret::Secret;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Prefix marking an envelope token inside a payload tree.
pub const ENVELOPE_PREFIX: &str = "$fg1$";

/// Supported field cipher algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CipherAlgorithm {
    /// AES-256 in Galois/Counter Mode with a detached 128-bit tag.
    #[default]
    Aes256Gcm,
}

impl CipherAlgorithm {
    /// Returns the canonical name, e.g. `AES-256-GCM`.
    pub fn as_str(self) -> &'static str {
        match self {
            CipherAlgorithm::Aes256Gcm => "AES-256-GCM",
        }
    }

    /// Returns `true` if the algorithm produces an authentication tag.
    pub fn is_aead(self) -> bool {
        matches!(self, CipherAlgorithm::Aes256Gcm)
    }

    /// Nonce length in bytes.
    pub fn nonce_len(self) -> usize {
        match self {
            CipherAlgorithm::Aes256Gcm => 12,
        }
    }

    /// Authentication tag length in bytes.
    pub fn tag_len(self) -> usize {
        match self {
            CipherAlgorithm::Aes256Gcm => 16,
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "AES256GCM" => Ok(CipherAlgorithm::Aes256Gcm),
            _ => Err(Error::invalid_config(format!("unsupported cipher algorithm '{}'", s))),
        }
    }
}

impl TryFrom<String> for CipherAlgorithm {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CipherAlgorithm> for String {
    fn from(algorithm: CipherAlgorithm) -> Self {
        algorithm.as_str().to_string()
    }
}

mod b64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// A protected field value.
///
/// Holds no plaintext and no key material. The algorithm is kept as the raw
/// name read from storage and checked when the value is decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    format_version: u8,
    #[serde(with = "b64")]
    ciphertext: Vec<u8>,
    key_version_id: KeyVersionId,
    algorithm: String,
    #[serde(with = "b64")]
    nonce: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    auth_tag: Option<Vec<u8>>,
}

impl EncryptedValue {
    fn from_sealed(sealed: SealedPayload, key: &KeyVersion, algorithm: CipherAlgorithm) -> Self {
        Self {
            format_version: ENVELOPE_VERSION,
            ciphertext: sealed.ciphertext,
            key_version_id: key.id().clone(),
            algorithm: algorithm.as_str().to_string(),
            nonce: sealed.nonce,
            auth_tag: sealed.auth_tag,
        }
    }

    /// Returns the envelope format version.
    pub fn format_version(&self) -> u8 {
        self.format_version
    }

    /// Returns the ciphertext bytes.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Returns the id of the key version that encrypted this value.
    pub fn key_version_id(&self) -> &KeyVersionId {
        &self.key_version_id
    }

    /// Returns the algorithm name as stored.
    pub fn algorithm_name(&self) -> &str {
        &self.algorithm
    }

    /// Parses the stored algorithm name.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::MalformedEnvelope`] for an unsupported algorithm.
    pub fn algorithm(&self) -> Result<CipherAlgorithm> {
        self.algorithm
            .parse()
            .map_err(|_| Error::malformed_envelope(format!("unsupported algorithm '{}'", self.algorithm)))
    }

    /// Returns the nonce bytes.
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Returns the detached authentication tag, if any.
    pub fn auth_tag(&self) -> Option<&[u8]> {
        self.auth_tag.as_deref()
    }

    /// Returns `true` if `value` looks like an envelope token.
    pub fn is_token(value: &str) -> bool {
        value.starts_with(ENVELOPE_PREFIX)
    }

    /// Encodes the envelope as a string token for embedding in a payload.
    pub fn to_token(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::malformed_envelope(format!("envelope encoding failed: {}", e)))?;
        Ok(format!("{}{}", ENVELOPE_PREFIX, URL_SAFE_NO_PAD.encode(json)))
    }

    /// Decodes a string token produced by [`to_token`](Self::to_token).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::MalformedEnvelope`] if the prefix, encoding, JSON,
    /// or format version is wrong.
    pub fn from_token(token: &str) -> Result<Self> {
        let encoded = token
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| Error::malformed_envelope("missing envelope prefix"))?;
        let json = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::malformed_envelope(format!("invalid base64: {}", e)))?;
        let value: EncryptedValue = serde_json::from_slice(&json)
            .map_err(|e| Error::malformed_envelope(format!("invalid envelope: {}", e)))?;
        if value.format_version != ENVELOPE_VERSION {
            return Err(Error::malformed_envelope(format!(
                "unsupported envelope version {}",
                value.format_version
            )));
        }
        Ok(value)
    }

    fn sealed(&self) -> SealedPayload {
        SealedPayload {
            ciphertext: self.ciphertext.clone(),
            nonce: self.nonce.clone(),
            auth_tag: self.auth_tag.clone(),
        }
    }
}

/// Builds the associated data that binds an envelope to its field.
///
/// Each component is length-prefixed so no two distinct tuples encode to the
/// same bytes.
fn associated_data(
    entity_type: &str,
    field_name: &str,
    key_version_id: &KeyVersionId,
    algorithm: CipherAlgorithm,
) -> Vec<u8> {
    let field = field_name.to_lowercase();
    let parts: [&[u8]; 5] = [
        b"fieldguard",
        entity_type.as_bytes(),
        field.as_bytes(),
        key_version_id.as_str().as_bytes(),
        algorithm.as_str().as_bytes(),
    ];
    let mut aad = Vec::new();
    for part in parts {
        aad.extend_from_slice(&(part.len() as u32).to_be_bytes());
        aad.extend_from_slice(part);
    }
    aad
}

/// Encrypts and decrypts individual field values.
#[derive(Debug, Clone)]
pub struct FieldCipher {
    keys: Arc<KeyManager>,
}

impl FieldCipher {
    /// Creates a cipher over `keys`.
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    /// Returns the key manager.
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Encrypts `plaintext` under the Active key of the entry's level.
    pub async fn encrypt(
        &self,
        plaintext: &str,
        entry: &ClassificationEntry,
        entity_type: &str,
        field_name: &str,
    ) -> Result<EncryptedValue> {
        self.encrypt_inner(plaintext, entry, entity_type, field_name)
            .await
            .map_err(|e| e.with_entity_type(entity_type).with_field(field_name))
    }

    /// Decrypts `envelope` with the key version it names.
    pub async fn decrypt(
        &self,
        envelope: &EncryptedValue,
        entry: &ClassificationEntry,
        entity_type: &str,
        field_name: &str,
    ) -> Result<Secret<String>> {
        self.decrypt_inner(envelope, entry, entity_type, field_name)
            .await
            .map_err(|e| e.with_entity_type(entity_type).with_field(field_name))
    }

    async fn encrypt_inner(
        &self,
        plaintext: &str,
        entry: &ClassificationEntry,
        entity_type: &str,
        field_name: &str,
    ) -> Result<EncryptedValue> {
        let algorithm = entry.algorithm();
        let key = self.keys.resolve_encrypt_key(entry.level())?;
        check_protection(entry, &key)?;

        let aad = associated_data(entity_type, field_name, key.id(), algorithm);
        let provider = self.keys.provider();
        let handle = key.handle();
        let sealed = self
            .keys
            .retry_policy()
            .call_provider("encrypt", || provider.encrypt(handle, plaintext.as_bytes(), &aad))
            .await?;

        if algorithm.is_aead() && sealed.auth_tag.is_none() {
            return Err(Error::new(
                ErrorKind::ProviderPermanent,
                "provider returned no authentication tag",
            ));
        }

        Ok(EncryptedValue::from_sealed(sealed, &key, algorithm))
    }

    async fn decrypt_inner(
        &self,
        envelope: &EncryptedValue,
        entry: &ClassificationEntry,
        entity_type: &str,
        field_name: &str,
    ) -> Result<Secret<String>> {
        if envelope.format_version() != ENVELOPE_VERSION {
            return Err(Error::malformed_envelope(format!(
                "unsupported envelope version {}",
                envelope.format_version()
            )));
        }
        let algorithm = envelope.algorithm()?;
        if envelope.nonce().len() != algorithm.nonce_len() {
            return Err(Error::malformed_envelope(format!(
                "nonce is {} bytes, {} expects {}",
                envelope.nonce().len(),
                algorithm,
                algorithm.nonce_len()
            )));
        }
        if algorithm.is_aead() {
            match envelope.auth_tag() {
                Some(tag) if tag.len() == algorithm.tag_len() => {}
                Some(_) => {
                    return Err(Error::malformed_envelope(
                        "authentication tag has wrong length",
                    ))
                }
                None => return Err(Error::malformed_envelope("missing authentication tag")),
            }
        }

        let key = self
            .keys
            .resolve_decrypt_key(entry.level(), envelope.key_version_id())?;
        check_protection(entry, &key)?;

        let aad = associated_data(entity_type, field_name, key.id(), algorithm);
        let sealed = envelope.sealed();
        let provider = self.keys.provider();
        let handle = key.handle();
        let opened = self
            .keys
            .retry_policy()
            .call_provider("decrypt", || provider.decrypt(handle, &sealed, &aad))
            .await?;

        match String::from_utf8(opened.expose_secret().clone()) {
            Ok(text) => Ok(Secret::new(text)),
            Err(err) => {
                err.into_bytes().zeroize();
                Err(Error::malformed_envelope("decrypted value is not valid UTF-8"))
            }
        }
    }
}

fn check_protection(entry: &ClassificationEntry, key: &KeyVersion) -> Result<()> {
    if entry.require_hsm() && !key.handle().is_hsm_backed() {
        return Err(Error::new(
            ErrorKind::KeyUnavailable,
            format!("key version '{}' is not HSM-backed", key.id()),
        ));
    }
    Ok(())
}
