//! Versioned key management.
//!
//! This module provides:
//! - `KeyVersion`: A key generation for one sensitivity level and its lifecycle state
//! - `KeyProviderGateway`: The external key-management provider abstraction
//! - `LocalKeyProvider`: In-process AES-256-GCM provider for development and tests
//! - `KeyManager`: Resolves encrypt/decrypt keys and performs rotation
//!
//! Key material never leaves the provider. The core only holds opaque
//! [`KeyHandle`]s that name the provider-side key.

mod manager;
mod provider;
mod version;

pub use manager::{KeyManager, KeyManagerConfig, PendingRotation};
pub use provider::{
    KeyHandle, KeyProtection, KeyProviderGateway, LocalKeyProvider, ProviderError,
    ProviderErrorKind, SealedPayload,
};
pub use version::{KeyStatus, KeyVersion, KeyVersionId};
