//! Key version identity and lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::KeyHandle;
use crate::classification::SensitivityLevel;

/// Identifier of a key generation, e.g. `critical-v3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyVersionId(String);

impl KeyVersionId {
    /// Builds the id for `version` of `level`.
    pub fn new(level: SensitivityLevel, version: u32) -> Self {
        Self(format!("{}-v{}", level.as_str(), version))
    }

    /// Wraps an id read from an envelope.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a key version.
///
/// ```text
/// Active --rotate--> Retiring --rotate / overlap elapsed--> Retired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Used for new encryptions and for decryption.
    Active,
    /// Decrypt only; a newer key is Active.
    Retiring,
    /// Decrypt only while inside the overlap window, then expired.
    Retired,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Active => write!(f, "active"),
            KeyStatus::Retiring => write!(f, "retiring"),
            KeyStatus::Retired => write!(f, "retired"),
        }
    }
}

/// One generation of key material for a sensitivity level.
///
/// Instances handed out by the [`KeyManager`](super::KeyManager) are
/// snapshots; mutating the lifecycle is only possible through rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersion {
    id: KeyVersionId,
    level: SensitivityLevel,
    version: u32,
    status: KeyStatus,
    created_at: DateTime<Utc>,
    retiring_since: Option<DateTime<Utc>>,
    retired_at: Option<DateTime<Utc>>,
    decrypt_until: Option<DateTime<Utc>>,
    handle: KeyHandle,
}

impl KeyVersion {
    pub(crate) fn new_active(
        level: SensitivityLevel,
        version: u32,
        handle: KeyHandle,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: KeyVersionId::new(level, version),
            level,
            version,
            status: KeyStatus::Active,
            created_at: now,
            retiring_since: None,
            retired_at: None,
            decrypt_until: None,
            handle,
        }
    }

    pub(crate) fn demote_to_retiring(&mut self, now: DateTime<Utc>) {
        self.status = KeyStatus::Retiring;
        self.retiring_since = Some(now);
    }

    /// Moves a Retiring key to Retired; decrypt stays allowed until
    /// `retiring_since + overlap`.
    pub(crate) fn retire(&mut self, now: DateTime<Utc>, overlap: chrono::Duration) {
        let since = self.retiring_since.unwrap_or(now);
        self.status = KeyStatus::Retired;
        self.retired_at = Some(now);
        self.decrypt_until = Some(since + overlap);
    }

    /// Returns the version id.
    pub fn id(&self) -> &KeyVersionId {
        &self.id
    }

    /// Returns the sensitivity level this key protects.
    pub fn level(&self) -> SensitivityLevel {
        self.level
    }

    /// Returns the monotonically increasing version number.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns the lifecycle state.
    pub fn status(&self) -> KeyStatus {
        self.status
    }

    /// Returns when the key was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns when the key stopped being Active.
    pub fn retiring_since(&self) -> Option<DateTime<Utc>> {
        self.retiring_since
    }

    /// Returns when the key became Retired.
    pub fn retired_at(&self) -> Option<DateTime<Utc>> {
        self.retired_at
    }

    /// Returns the end of the decrypt overlap window for a Retired key.
    pub fn decrypt_until(&self) -> Option<DateTime<Utc>> {
        self.decrypt_until
    }

    /// Returns the provider handle.
    pub fn handle(&self) -> &KeyHandle {
        &self.handle
    }

    /// Returns `true` if the key may be used for new encryptions.
    pub fn can_encrypt(&self) -> bool {
        self.status == KeyStatus::Active
    }

    /// Returns `true` if the key may decrypt at `now`.
    pub fn can_decrypt_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            KeyStatus::Active | KeyStatus::Retiring => true,
            KeyStatus::Retired => self.decrypt_until.is_some_and(|until| now < until),
        }
    }
}
