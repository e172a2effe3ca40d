//! Key-management provider abstraction.
//!
//! The symmetric cipher primitive lives behind [`KeyProviderGateway`]. A
//! managed KMS implements it in production; [`LocalKeyProvider`] implements it
//! in-process for development and tests.

use std::collections::HashMap;
use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use uuid::Uuid;

use crate::classification::SensitivityLevel;
use crate::secret::Secret;

const AES_GCM_NONCE_LEN: usize = 12;
const AES_GCM_TAG_LEN: usize = 16;

/// Where key material is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyProtection {
    /// Software-held key material.
    Software,
    /// Hardware security module.
    Hsm,
}

/// Opaque reference to provider-side key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHandle {
    provider: String,
    key_ref: String,
    protection: KeyProtection,
}

impl KeyHandle {
    /// Creates a handle.
    pub fn new(
        provider: impl Into<String>,
        key_ref: impl Into<String>,
        protection: KeyProtection,
    ) -> Self {
        Self {
            provider: provider.into(),
            key_ref: key_ref.into(),
            protection,
        }
    }

    /// Returns the provider name that issued the handle.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Returns the provider-side key reference.
    pub fn key_ref(&self) -> &str {
        &self.key_ref
    }

    /// Returns how the key material is protected.
    pub fn protection(&self) -> KeyProtection {
        self.protection
    }

    /// Returns `true` for HSM-backed keys.
    pub fn is_hsm_backed(&self) -> bool {
        self.protection == KeyProtection::Hsm
    }
}

/// Output of a provider encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// Ciphertext without the authentication tag
    pub ciphertext: Vec<u8>,
    /// Nonce / IV
    pub nonce: Vec<u8>,
    /// Detached authentication tag, for AEAD algorithms
    pub auth_tag: Option<Vec<u8>>,
}

/// Provider failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Call did not complete in time.
    Timeout,
    /// Provider is rate limiting.
    Throttled,
    /// Provider is temporarily unreachable.
    Unavailable,
    /// Credentials rejected.
    Unauthorized,
    /// Request is malformed or unsupported.
    InvalidRequest,
    /// Key reference is unknown to the provider.
    UnknownKey,
    /// Ciphertext failed authentication.
    IntegrityFailure,
}

impl ProviderErrorKind {
    /// Returns `true` for failures worth retrying.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::Timeout | ProviderErrorKind::Throttled | ProviderErrorKind::Unavailable
        )
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::Timeout => write!(f, "timeout"),
            ProviderErrorKind::Throttled => write!(f, "throttled"),
            ProviderErrorKind::Unavailable => write!(f, "unavailable"),
            ProviderErrorKind::Unauthorized => write!(f, "unauthorized"),
            ProviderErrorKind::InvalidRequest => write!(f, "invalid request"),
            ProviderErrorKind::UnknownKey => write!(f, "unknown key"),
            ProviderErrorKind::IntegrityFailure => write!(f, "integrity failure"),
        }
    }
}

/// Error reported by a [`KeyProviderGateway`].
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("provider {kind}: {message}")]
pub struct ProviderError {
    kind: ProviderErrorKind,
    message: String,
}

impl ProviderError {
    /// Creates a provider error.
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Returns the failure category.
    pub fn kind(&self) -> ProviderErrorKind {
        self.kind
    }

    /// Returns the message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if retrying may help.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// External key-management provider.
///
/// Implementations must be safe to call concurrently. Every call is a
/// suspension point; the core wraps each call in a timeout and retries
/// transient failures.
#[async_trait]
pub trait KeyProviderGateway: Send + Sync {
    /// Provider name recorded in issued handles.
    fn name(&self) -> &str;

    /// Creates new key material for `level` and returns a handle to it.
    async fn wrap_key(
        &self,
        level: SensitivityLevel,
        protection: KeyProtection,
    ) -> Result<KeyHandle, ProviderError>;

    /// Encrypts `plaintext` under `handle`, authenticating `aad`.
    async fn encrypt(
        &self,
        handle: &KeyHandle,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<SealedPayload, ProviderError>;

    /// Decrypts `sealed` under `handle`, verifying `aad`.
    async fn decrypt(
        &self,
        handle: &KeyHandle,
        sealed: &SealedPayload,
        aad: &[u8],
    ) -> Result<Secret<Vec<u8>>, ProviderError>;
}

/// In-process AES-256-GCM provider.
///
/// Keys live in memory for the life of the provider. Intended for
/// development, tests, and single-node deployments that accept software keys.
///
/// # Examples
///
/// ```
/// use fieldguard_core::{KeyProtection, KeyProviderGateway, LocalKeyProvider, SensitivityLevel};
///
/// # tokio_test_block_on(async {
/// let provider = LocalKeyProvider::new();
/// let handle = provider
///     .wrap_key(SensitivityLevel::Critical, KeyProtection::Software)
///     .await
///     .unwrap();
///
/// let sealed = provider.encrypt(&handle, b"A1234567", b"aad").await.unwrap();
/// let opened = provider.decrypt(&handle, &sealed, b"aad").await.unwrap();
/// assert_eq!(opened.expose_secret().as_slice(), b"A1234567");
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub struct LocalKeyProvider {
    name: String,
    hsm_available: bool,
    keys: RwLock<HashMap<String, Secret<Vec<u8>>>>,
}

impl LocalKeyProvider {
    /// Creates a provider that issues software keys only.
    pub fn new() -> Self {
        Self {
            name: "local".to_string(),
            hsm_available: false,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a provider that also accepts HSM-protected key requests.
    ///
    /// The material is still held in process memory; this only lets
    /// development setups exercise `require_hsm` classifications.
    pub fn with_simulated_hsm() -> Self {
        Self {
            name: "local-hsm".to_string(),
            hsm_available: true,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the number of keys held.
    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }

    fn cipher_for(&self, handle: &KeyHandle) -> Result<Aes256Gcm, ProviderError> {
        if handle.provider() != self.name {
            return Err(ProviderError::new(
                ProviderErrorKind::UnknownKey,
                format!("handle issued by provider '{}'", handle.provider()),
            ));
        }
        let keys = self.keys.read();
        let material = keys.get(handle.key_ref()).ok_or_else(|| {
            ProviderError::new(ProviderErrorKind::UnknownKey, "key reference not found")
        })?;
        let key = Key::<Aes256Gcm>::from_slice(material.expose_secret());
        Ok(Aes256Gcm::new(key))
    }
}

impl Default for LocalKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyProviderGateway for LocalKeyProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn wrap_key(
        &self,
        level: SensitivityLevel,
        protection: KeyProtection,
    ) -> Result<KeyHandle, ProviderError> {
        if protection == KeyProtection::Hsm && !self.hsm_available {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidRequest,
                "HSM protection is not available",
            ));
        }

        let key = Aes256Gcm::generate_key(OsRng);
        let key_ref = format!("{}-{}", level.as_str(), Uuid::new_v4());
        self.keys
            .write()
            .insert(key_ref.clone(), Secret::new(key.to_vec()));

        tracing::debug!(provider = %self.name, level = %level, key_ref = %key_ref, "wrapped new key");

        Ok(KeyHandle::new(self.name.clone(), key_ref, protection))
    }

    async fn encrypt(
        &self,
        handle: &KeyHandle,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<SealedPayload, ProviderError> {
        let cipher = self.cipher_for(handle)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let mut sealed = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|_| ProviderError::new(ProviderErrorKind::InvalidRequest, "encryption failed"))?;

        // aes-gcm appends the tag; the envelope stores it detached.
        let tag = sealed.split_off(sealed.len() - AES_GCM_TAG_LEN);

        Ok(SealedPayload {
            ciphertext: sealed,
            nonce: nonce.to_vec(),
            auth_tag: Some(tag),
        })
    }

    async fn decrypt(
        &self,
        handle: &KeyHandle,
        sealed: &SealedPayload,
        aad: &[u8],
    ) -> Result<Secret<Vec<u8>>, ProviderError> {
        if sealed.nonce.len() != AES_GCM_NONCE_LEN {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidRequest,
                "nonce has wrong length",
            ));
        }
        let tag = match &sealed.auth_tag {
            Some(tag) if tag.len() == AES_GCM_TAG_LEN => tag,
            _ => {
                return Err(ProviderError::new(
                    ProviderErrorKind::InvalidRequest,
                    "missing or malformed authentication tag",
                ))
            }
        };

        let cipher = self.cipher_for(handle)?;
        let mut combined = Vec::with_capacity(sealed.ciphertext.len() + AES_GCM_TAG_LEN);
        combined.extend_from_slice(&sealed.ciphertext);
        combined.extend_from_slice(tag);

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &combined,
                    aad,
                },
            )
            .map_err(|_| {
                ProviderError::new(ProviderErrorKind::IntegrityFailure, "authentication failed")
            })?;

        Ok(Secret::new(plaintext))
    }
}
