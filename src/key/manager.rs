//! Per-level key lifecycle.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};

use super::{KeyProtection, KeyProviderGateway, KeyStatus, KeyVersion, KeyVersionId};
use crate::classification::SensitivityLevel;
use crate::error::{Error, ErrorKind, Result};
use crate::retry::RetryPolicy;

/// Settings for a [`KeyManager`].
#[derive(Debug, Clone, Default)]
pub struct KeyManagerConfig {
    overlap_days: BTreeMap<SensitivityLevel, u32>,
    hsm_levels: BTreeSet<SensitivityLevel>,
    retry: RetryPolicy,
}

impl KeyManagerConfig {
    /// Creates a config with default overlap windows and retry policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long a superseded key keeps decrypting for `level`.
    pub fn with_overlap_days(mut self, level: SensitivityLevel, days: u32) -> Self {
        self.overlap_days.insert(level, days);
        self
    }

    /// Requests HSM-protected key material for `level`.
    pub fn with_hsm_level(mut self, level: SensitivityLevel) -> Self {
        self.hsm_levels.insert(level);
        self
    }

    /// Sets the retry policy for provider calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the overlap window for `level`.
    ///
    /// Defaults to the level's rotation interval.
    pub fn overlap(&self, level: SensitivityLevel) -> Duration {
        let days = self
            .overlap_days
            .get(&level)
            .copied()
            .unwrap_or_else(|| level.default_rotation_days());
        Duration::days(i64::from(days))
    }

    /// Returns the protection requested for new keys of `level`.
    pub fn protection(&self, level: SensitivityLevel) -> KeyProtection {
        if self.hsm_levels.contains(&level) {
            KeyProtection::Hsm
        } else {
            KeyProtection::Software
        }
    }

    /// Returns the retry policy.
    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
}

/// Resolves encryption and decryption keys and performs rotation.
///
/// State lives behind a synchronous read/write lock that is never held
/// across an await. Rotations are serialized by a separate async gate so the
/// provider round-trip for new key material does not block readers.
///
/// At every observable point each provisioned level has exactly one
/// [`KeyStatus::Active`] key.
pub struct KeyManager {
    provider: Arc<dyn KeyProviderGateway>,
    config: KeyManagerConfig,
    state: RwLock<HashMap<SensitivityLevel, Vec<KeyVersion>>>,
    rotation_gate: Mutex<()>,
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .field("levels", &self.active_levels())
            .finish()
    }
}

impl KeyManager {
    /// Creates a manager with no keys provisioned.
    pub fn new(provider: Arc<dyn KeyProviderGateway>, config: KeyManagerConfig) -> Self {
        Self {
            provider,
            config,
            state: RwLock::new(HashMap::new()),
            rotation_gate: Mutex::new(()),
        }
    }

    /// Restores a manager from previously persisted key versions.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfiguration`] if two versions share an id
    /// or a level has more than one Active key.
    pub fn from_versions(
        provider: Arc<dyn KeyProviderGateway>,
        config: KeyManagerConfig,
        versions: impl IntoIterator<Item = KeyVersion>,
    ) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut state: HashMap<SensitivityLevel, Vec<KeyVersion>> = HashMap::new();

        for version in versions {
            if !ids.insert(version.id().clone()) {
                return Err(Error::invalid_config(format!(
                    "duplicate key version '{}'",
                    version.id()
                )));
            }
            state.entry(version.level()).or_default().push(version);
        }

        for (level, keys) in state.iter_mut() {
            let active = keys.iter().filter(|k| k.status() == KeyStatus::Active).count();
            if active > 1 {
                return Err(Error::invalid_config(format!(
                    "level {} has {} active keys",
                    level, active
                )));
            }
            keys.sort_by_key(KeyVersion::version);
        }

        Ok(Self {
            provider,
            config,
            state: RwLock::new(state),
            rotation_gate: Mutex::new(()),
        })
    }

    /// Returns the provider gateway.
    pub fn provider(&self) -> &Arc<dyn KeyProviderGateway> {
        &self.provider
    }

    /// Returns the manager config.
    pub fn config(&self) -> &KeyManagerConfig {
        &self.config
    }

    /// Returns the retry policy applied to provider calls.
    pub fn retry_policy(&self) -> &RetryPolicy {
        self.config.retry()
    }

    /// Returns the Active key for `level`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::KeyUnavailable`] if the level has no Active key.
    /// There is no fallback key.
    pub fn resolve_encrypt_key(&self, level: SensitivityLevel) -> Result<KeyVersion> {
        let state = self.state.read();
        state
            .get(&level)
            .and_then(|keys| keys.iter().find(|k| k.can_encrypt()))
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::KeyUnavailable,
                    format!("no active key for level {}", level),
                )
            })
    }

    /// Returns the key version `id` of `level` if it may still decrypt.
    pub fn resolve_decrypt_key(
        &self,
        level: SensitivityLevel,
        id: &KeyVersionId,
    ) -> Result<KeyVersion> {
        self.resolve_decrypt_key_at(level, id, Utc::now())
    }

    /// Same as [`resolve_decrypt_key`](Self::resolve_decrypt_key), evaluated at `now`.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::KeyUnavailable`] if `id` is unknown or belongs to another level
    /// - [`ErrorKind::KeyExpired`] if the key is Retired and its overlap window has closed
    pub fn resolve_decrypt_key_at(
        &self,
        level: SensitivityLevel,
        id: &KeyVersionId,
        now: DateTime<Utc>,
    ) -> Result<KeyVersion> {
        let state = self.state.read();

        let key = match state
            .get(&level)
            .and_then(|keys| keys.iter().find(|k| k.id() == id))
        {
            Some(key) => key,
            None => {
                let elsewhere = state
                    .iter()
                    .any(|(other, keys)| *other != level && keys.iter().any(|k| k.id() == id));
                let message = if elsewhere {
                    format!("key version '{}' does not belong to level {}", id, level)
                } else {
                    format!("unknown key version '{}'", id)
                };
                return Err(Error::new(ErrorKind::KeyUnavailable, message));
            }
        };

        if key.can_decrypt_at(now) {
            Ok(key.clone())
        } else {
            Err(Error::new(
                ErrorKind::KeyExpired,
                format!("key version '{}' is past its overlap window", id),
            ))
        }
    }

    /// Starts a rotation of `level`.
    ///
    /// Acquires the rotation gate and asks the provider for new key material.
    /// Nothing changes until [`PendingRotation::commit`] is called; dropping
    /// the returned value abandons the rotation and releases the gate.
    pub async fn prepare_rotation(
        &self,
        level: SensitivityLevel,
        now: DateTime<Utc>,
    ) -> Result<PendingRotation<'_>> {
        let gate = self.rotation_gate.lock().await;

        let (next_version, previous_active) = {
            let state = self.state.read();
            let keys = state.get(&level);
            let next = keys
                .and_then(|keys| keys.iter().map(KeyVersion::version).max())
                .unwrap_or(0)
                + 1;
            let active = keys
                .and_then(|keys| keys.iter().find(|k| k.can_encrypt()))
                .map(|k| k.id().clone());
            (next, active)
        };

        let protection = self.config.protection(level);
        let provider = &self.provider;
        let handle = self
            .config
            .retry()
            .call_provider("wrap_key", || provider.wrap_key(level, protection))
            .await?;

        Ok(PendingRotation {
            manager: self,
            _gate: gate,
            key: KeyVersion::new_active(level, next_version, handle, now),
            previous_active,
            now,
        })
    }

    /// Rotates `level` immediately and returns the new Active key.
    pub async fn rotate(&self, level: SensitivityLevel) -> Result<KeyVersion> {
        Ok(self.prepare_rotation(level, Utc::now()).await?.commit())
    }

    /// Moves Retiring keys whose overlap window has closed to Retired.
    ///
    /// Returns the ids that changed state.
    pub fn retire_expired(&self, now: DateTime<Utc>) -> Vec<KeyVersionId> {
        let mut retired = Vec::new();
        let mut state = self.state.write();

        for (level, keys) in state.iter_mut() {
            let overlap = self.config.overlap(*level);
            for key in keys.iter_mut() {
                let expired = key.status() == KeyStatus::Retiring
                    && key.retiring_since().is_some_and(|since| since + overlap <= now);
                if expired {
                    key.retire(now, overlap);
                    retired.push(key.id().clone());
                }
            }
        }

        if !retired.is_empty() {
            tracing::info!(count = retired.len(), "retired keys past their overlap window");
        }
        retired
    }

    /// Returns `true` if `level` has no Active key or its Active key is older
    /// than `interval`.
    pub fn rotation_due(
        &self,
        level: SensitivityLevel,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let state = self.state.read();
        match state
            .get(&level)
            .and_then(|keys| keys.iter().find(|k| k.can_encrypt()))
        {
            Some(active) => now - active.created_at() >= interval,
            None => true,
        }
    }

    /// Returns all versions of `level`, oldest first.
    pub fn versions(&self, level: SensitivityLevel) -> Vec<KeyVersion> {
        self.state.read().get(&level).cloned().unwrap_or_default()
    }

    /// Returns the levels that currently have an Active key.
    pub fn active_levels(&self) -> Vec<SensitivityLevel> {
        let state = self.state.read();
        SensitivityLevel::ALL
            .into_iter()
            .filter(|level| {
                state
                    .get(level)
                    .is_some_and(|keys| keys.iter().any(|k| k.can_encrypt()))
            })
            .collect()
    }

    /// Returns every key version across all levels, for persistence.
    pub fn snapshot(&self) -> Vec<KeyVersion> {
        let state = self.state.read();
        SensitivityLevel::ALL
            .into_iter()
            .filter_map(|level| state.get(&level))
            .flat_map(|keys| keys.iter().cloned())
            .collect()
    }

    fn commit_rotation(&self, key: KeyVersion, now: DateTime<Utc>) -> KeyVersion {
        let level = key.level();
        let overlap = self.config.overlap(level);
        let mut state = self.state.write();
        let keys = state.entry(level).or_default();

        for existing in keys.iter_mut() {
            match existing.status() {
                KeyStatus::Active => existing.demote_to_retiring(now),
                KeyStatus::Retiring => existing.retire(now, overlap),
                KeyStatus::Retired => {}
            }
        }
        keys.push(key.clone());
        drop(state);

        tracing::info!(level = %level, key_version_id = %key.id(), "key rotated");
        key
    }
}

/// A rotation whose new key material exists but is not yet visible.
///
/// Holds the rotation gate until committed or dropped.
pub struct PendingRotation<'a> {
    manager: &'a KeyManager,
    _gate: MutexGuard<'a, ()>,
    key: KeyVersion,
    previous_active: Option<KeyVersionId>,
    now: DateTime<Utc>,
}

impl fmt::Debug for PendingRotation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRotation")
            .field("key", &self.key.id())
            .field("previous_active", &self.previous_active)
            .finish()
    }
}

impl<'a> PendingRotation<'a> {
    /// Returns the key that will become Active.
    pub fn key(&self) -> &KeyVersion {
        &self.key
    }

    /// Returns the key that will be demoted to Retiring, if any.
    pub fn previous_active(&self) -> Option<&KeyVersionId> {
        self.previous_active.as_ref()
    }

    /// Publishes the new key and demotes its predecessors.
    pub fn commit(self) -> KeyVersion {
        self.manager.commit_rotation(self.key, self.now)
    }
}
