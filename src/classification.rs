//! Declarative field classification.
//!
//! The registry maps `(entity_type, field_name)` to a [`ClassificationEntry`]
//! describing how that field must be protected. It is loaded once at startup
//! and is read-only for the rest of the process lifetime: adding a sensitive
//! field requires a redeploy.
//!
//! Matching is exact on `entity_type` and case-insensitive on `field_name`.
//! There is no wildcard or prefix matching, and duplicate entries are rejected
//! at load time rather than resolved.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cipher::CipherAlgorithm;
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::persistence::PersistenceGateway;

/// How sensitive a classified field is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityLevel {
    /// Government identifiers, account numbers, credentials.
    #[serde(alias = "Critical")]
    Critical,
    /// Personal data that is harmful if disclosed.
    #[serde(alias = "Sensitive")]
    Sensitive,
    /// Internal data that still must not be stored in the clear.
    #[serde(alias = "Internal")]
    Internal,
}

impl SensitivityLevel {
    /// Every level, most sensitive first.
    pub const ALL: [SensitivityLevel; 3] = [
        SensitivityLevel::Critical,
        SensitivityLevel::Sensitive,
        SensitivityLevel::Internal,
    ];

    /// Default key rotation interval in days.
    pub fn default_rotation_days(self) -> u32 {
        match self {
            SensitivityLevel::Critical => 90,
            SensitivityLevel::Sensitive => 180,
            SensitivityLevel::Internal => 365,
        }
    }

    /// Stable lowercase name used in key version ids and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            SensitivityLevel::Critical => "critical",
            SensitivityLevel::Sensitive => "sensitive",
            SensitivityLevel::Internal => "internal",
        }
    }
}

impl fmt::Display for SensitivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensitivityLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(SensitivityLevel::Critical),
            "sensitive" => Ok(SensitivityLevel::Sensitive),
            "internal" => Ok(SensitivityLevel::Internal),
            other => Err(Error::invalid_config(format!(
                "unknown sensitivity level '{}'",
                other
            ))),
        }
    }
}

/// Protection policy for one field of one entity type.
///
/// # Examples
///
/// ```
/// use fieldguard_core::{ClassificationEntry, SensitivityLevel};
///
/// let entry = ClassificationEntry::new("Identifier", "Value", SensitivityLevel::Critical)
///     .with_require_hsm(false);
///
/// assert_eq!(entry.rotation_interval_days(), 90);
/// assert!(entry.require_audit());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationEntry {
    entity_type: String,
    field_name: String,
    level: SensitivityLevel,
    algorithm: CipherAlgorithm,
    rotation_interval_days: u32,
    require_hsm: bool,
    require_audit: bool,
}

impl ClassificationEntry {
    /// Creates an entry with level defaults.
    ///
    /// Defaults: AES-256-GCM, the level's rotation interval, no HSM, and
    /// `require_audit` set only for [`SensitivityLevel::Critical`].
    pub fn new(
        entity_type: impl Into<String>,
        field_name: impl Into<String>,
        level: SensitivityLevel,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            field_name: field_name.into(),
            level,
            algorithm: CipherAlgorithm::default(),
            rotation_interval_days: level.default_rotation_days(),
            require_hsm: false,
            require_audit: level == SensitivityLevel::Critical,
        }
    }

    /// Sets the cipher algorithm.
    pub fn with_algorithm(mut self, algorithm: CipherAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Sets the rotation interval in days.
    pub fn with_rotation_interval_days(mut self, days: u32) -> Self {
        self.rotation_interval_days = days;
        self
    }

    /// Requires HSM-backed key material.
    pub fn with_require_hsm(mut self, require_hsm: bool) -> Self {
        self.require_hsm = require_hsm;
        self
    }

    /// Makes audit-write failures fatal for this field regardless of level.
    pub fn with_require_audit(mut self, require_audit: bool) -> Self {
        self.require_audit = require_audit;
        self
    }

    /// Returns the entity type.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Returns the field name as configured.
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Returns the sensitivity level.
    pub fn level(&self) -> SensitivityLevel {
        self.level
    }

    /// Returns the cipher algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Returns the rotation interval in days.
    pub fn rotation_interval_days(&self) -> u32 {
        self.rotation_interval_days
    }

    /// Returns whether HSM-backed keys are required.
    pub fn require_hsm(&self) -> bool {
        self.require_hsm
    }

    /// Returns whether audit-write failures are fatal for this field.
    pub fn require_audit(&self) -> bool {
        self.require_audit
    }

    fn validate(&self) -> Result<()> {
        if self.entity_type.trim().is_empty() {
            return Err(Error::invalid_config("classification entity_type is empty"));
        }
        if self.field_name.trim().is_empty() {
            return Err(Error::invalid_config("classification field_name is empty")
                .with_entity_type(&self.entity_type));
        }
        if self.rotation_interval_days == 0 {
            return Err(Error::invalid_config("rotation_interval_days must be positive")
                .with_entity_type(&self.entity_type)
                .with_field(&self.field_name));
        }
        Ok(())
    }
}

type RegistryKey = (String, String);

fn registry_key(entity_type: &str, field_name: &str) -> RegistryKey {
    (entity_type.to_string(), field_name.to_lowercase())
}

/// Read-only table of classification entries.
///
/// # Examples
///
/// ```
/// use fieldguard_core::{ClassificationEntry, ClassificationRegistry, ErrorKind, SensitivityLevel};
///
/// let registry = ClassificationRegistry::from_entries(vec![
///     ClassificationEntry::new("Identifier", "Value", SensitivityLevel::Critical),
/// ])
/// .unwrap();
///
/// // Field names are case-insensitive, entity types are not.
/// assert!(registry.lookup("Identifier", "value").is_ok());
/// assert_eq!(
///     registry.lookup("identifier", "Value").unwrap_err().kind(),
///     ErrorKind::NotClassified
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClassificationRegistry {
    entries: HashMap<RegistryKey, ClassificationEntry>,
}

impl ClassificationRegistry {
    /// Builds a registry, rejecting invalid or duplicate entries.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfiguration`](crate::ErrorKind::InvalidConfiguration)
    /// if an entry is invalid or two entries collide on
    /// `(entity_type, lowercase(field_name))`.
    pub fn from_entries(entries: impl IntoIterator<Item = ClassificationEntry>) -> Result<Self> {
        let mut map = HashMap::new();
        for entry in entries {
            entry.validate()?;
            let key = registry_key(&entry.entity_type, &entry.field_name);
            if map.contains_key(&key) {
                return Err(Error::invalid_config("duplicate classification entry")
                    .with_entity_type(&entry.entity_type)
                    .with_field(&entry.field_name));
            }
            map.insert(key, entry);
        }
        tracing::info!(entries = map.len(), "classification registry loaded");
        Ok(Self { entries: map })
    }

    /// Builds the registry from the `[[classification]]` section of a config.
    pub fn from_config(config: &CoreConfig) -> Result<Self> {
        Self::from_entries(config.classification_entries())
    }

    /// Loads the registry from the persistence collaborator.
    ///
    /// This is the startup bootstrap path; the result is immutable.
    pub async fn bootstrap(gateway: &dyn PersistenceGateway) -> Result<Self> {
        let entries = gateway.load_classifications().await?;
        Self::from_entries(entries)
    }

    /// Looks up the entry for a field.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotClassified`](crate::ErrorKind::NotClassified) if no
    /// entry matches. Absence is never treated as "not sensitive".
    pub fn lookup(&self, entity_type: &str, field_name: &str) -> Result<&ClassificationEntry> {
        self.find(entity_type, field_name)
            .ok_or_else(|| Error::not_classified(entity_type, field_name))
    }

    /// Looks up the entry for a field, returning `None` if unclassified.
    pub fn find(&self, entity_type: &str, field_name: &str) -> Option<&ClassificationEntry> {
        self.entries.get(&registry_key(entity_type, field_name))
    }

    /// Returns `true` if the field is classified.
    pub fn is_classified(&self, entity_type: &str, field_name: &str) -> bool {
        self.find(entity_type, field_name).is_some()
    }

    /// Returns the levels that have at least one classified field.
    pub fn levels(&self) -> Vec<SensitivityLevel> {
        SensitivityLevel::ALL
            .into_iter()
            .filter(|level| self.entries.values().any(|e| e.level == *level))
            .collect()
    }

    /// Returns all entries at `level`.
    pub fn entries_for_level(&self, level: SensitivityLevel) -> Vec<&ClassificationEntry> {
        self.entries.values().filter(|e| e.level == level).collect()
    }

    /// Returns the rotation interval for `level` in days.
    ///
    /// The shortest interval configured among entries of that level wins. If
    /// the level has no entries, `default_days` is used.
    pub fn rotation_interval_days(&self, level: SensitivityLevel, default_days: u32) -> u32 {
        self.entries
            .values()
            .filter(|e| e.level == level)
            .map(|e| e.rotation_interval_days)
            .min()
            .unwrap_or(default_days)
    }

    /// Returns `true` if any entry at `level` requires HSM-backed keys.
    pub fn requires_hsm(&self, level: SensitivityLevel) -> bool {
        self.entries
            .values()
            .any(|e| e.level == level && e.require_hsm)
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
