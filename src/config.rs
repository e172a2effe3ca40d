//! Declarative configuration.
//!
//! Configuration is read once at startup from TOML or JSON and is immutable
//! afterwards.
//!
//! ```toml
//! [rotation]
//! critical_days = 90
//! sensitive_days = 180
//! internal_days = 365
//! critical_overlap_days = 30
//!
//! [retry]
//! max_attempts = 4
//! initial_delay_ms = 50
//!
//! [audit]
//! critical_retention_days = 2555
//!
//! [[classification]]
//! entity_type = "Identifier"
//! field_name = "Value"
//! level = "critical"
//! algorithm = "AES-256-GCM"
//! require_hsm = false
//! ```

use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::audit::AuditConfig;
use crate::cipher::CipherAlgorithm;
use crate::classification::{ClassificationEntry, ClassificationRegistry, SensitivityLevel};
use crate::error::{Error, Result};
use crate::key::KeyManagerConfig;
use crate::retry::RetryPolicy;

/// Environment variable naming the config file for [`CoreConfig::from_env`].
pub const CONFIG_ENV_VAR: &str = "FIELDGUARD_CONFIG";

/// Rotation schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RotationConfig {
    /// Default rotation interval for Critical keys
    pub critical_days: u32,
    /// Default rotation interval for Sensitive keys
    pub sensitive_days: u32,
    /// Default rotation interval for Internal keys
    pub internal_days: u32,
    /// Decrypt overlap for Critical keys; defaults to the rotation interval
    pub critical_overlap_days: Option<u32>,
    /// Decrypt overlap for Sensitive keys; defaults to the rotation interval
    pub sensitive_overlap_days: Option<u32>,
    /// Decrypt overlap for Internal keys; defaults to the rotation interval
    pub internal_overlap_days: Option<u32>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            critical_days: SensitivityLevel::Critical.default_rotation_days(),
            sensitive_days: SensitivityLevel::Sensitive.default_rotation_days(),
            internal_days: SensitivityLevel::Internal.default_rotation_days(),
            critical_overlap_days: None,
            sensitive_overlap_days: None,
            internal_overlap_days: None,
        }
    }
}

impl RotationConfig {
    /// Default rotation interval for `level`, in days.
    pub fn days_for(&self, level: SensitivityLevel) -> u32 {
        match level {
            SensitivityLevel::Critical => self.critical_days,
            SensitivityLevel::Sensitive => self.sensitive_days,
            SensitivityLevel::Internal => self.internal_days,
        }
    }

    /// Explicit overlap window for `level`, in days.
    pub fn overlap_days_for(&self, level: SensitivityLevel) -> Option<u32> {
        match level {
            SensitivityLevel::Critical => self.critical_overlap_days,
            SensitivityLevel::Sensitive => self.sensitive_overlap_days,
            SensitivityLevel::Internal => self.internal_overlap_days,
        }
    }

    /// Effective rotation interval for `level` given the loaded entries.
    pub fn interval(&self, level: SensitivityLevel, registry: &ClassificationRegistry) -> Duration {
        let days = registry.rotation_interval_days(level, self.days_for(level));
        Duration::days(i64::from(days))
    }

    /// Builds key manager settings for `registry`.
    ///
    /// A level without an explicit overlap uses its effective rotation
    /// interval. Levels with any `require_hsm` entry get HSM keys.
    pub fn key_manager_config(
        &self,
        retry: &RetryPolicy,
        registry: &ClassificationRegistry,
    ) -> KeyManagerConfig {
        let mut config = KeyManagerConfig::new().with_retry(retry.clone());
        for level in SensitivityLevel::ALL {
            let overlap = self
                .overlap_days_for(level)
                .unwrap_or_else(|| registry.rotation_interval_days(level, self.days_for(level)));
            config = config.with_overlap_days(level, overlap);
            if registry.requires_hsm(level) {
                config = config.with_hsm_level(level);
            }
        }
        config
    }

    fn validate(&self) -> Result<()> {
        for level in SensitivityLevel::ALL {
            if self.days_for(level) == 0 {
                return Err(Error::invalid_config(format!(
                    "rotation interval for {} must be positive",
                    level
                )));
            }
            if self.overlap_days_for(level) == Some(0) {
                return Err(Error::invalid_config(format!(
                    "overlap window for {} must be positive",
                    level
                )));
            }
        }
        Ok(())
    }
}

/// One `[[classification]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassificationConfig {
    /// Entity type, matched exactly
    pub entity_type: String,
    /// Field name, matched case-insensitively
    pub field_name: String,
    /// Sensitivity level
    pub level: SensitivityLevel,
    /// Cipher algorithm name
    #[serde(default)]
    pub algorithm: CipherAlgorithm,
    /// Overrides the level's rotation interval
    #[serde(default)]
    pub rotation_interval_days: Option<u32>,
    /// Require HSM-backed keys
    #[serde(default)]
    pub require_hsm: bool,
    /// Make audit write failures fatal; defaults to `true` for Critical
    #[serde(default)]
    pub require_audit: Option<bool>,
}

impl ClassificationConfig {
    fn to_entry(&self, rotation: &RotationConfig) -> ClassificationEntry {
        let entry = ClassificationEntry::new(&self.entity_type, &self.field_name, self.level)
            .with_algorithm(self.algorithm)
            .with_rotation_interval_days(
                self.rotation_interval_days
                    .unwrap_or_else(|| rotation.days_for(self.level)),
            )
            .with_require_hsm(self.require_hsm);
        match self.require_audit {
            Some(require) => entry.with_require_audit(require),
            None => entry,
        }
    }
}

/// Complete core configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Rotation schedule
    pub rotation: RotationConfig,
    /// Provider retry policy
    pub retry: RetryPolicy,
    /// Audit retention
    pub audit: AuditConfig,
    /// Classification table
    #[serde(rename = "classification")]
    pub classifications: Vec<ClassificationConfig>,
}

impl CoreConfig {
    /// Loads and validates a config file. `.json` files are read as JSON,
    /// everything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("cannot read {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };
        tracing::info!(
            path = %path.display(),
            classifications = config.classifications.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Loads the file named by `FIELDGUARD_CONFIG`.
    ///
    /// Falls back to the built-in defaults, which classify nothing, when the
    /// variable is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) => Self::load(path),
            Err(_) => {
                tracing::warn!(
                    var = CONFIG_ENV_VAR,
                    "config variable not set, using defaults with no classifications"
                );
                Ok(Self::default())
            }
        }
    }

    /// Parses and validates TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::invalid_config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates JSON.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| Error::invalid_config(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section, including duplicate classification entries.
    pub fn validate(&self) -> Result<()> {
        self.rotation.validate()?;
        self.retry.validate()?;
        self.audit.validate()?;
        self.registry().map(|_| ())
    }

    /// Returns the classification entries with defaults applied.
    pub fn classification_entries(&self) -> Vec<ClassificationEntry> {
        self.classifications
            .iter()
            .map(|c| c.to_entry(&self.rotation))
            .collect()
    }

    /// Builds the classification registry.
    pub fn registry(&self) -> Result<ClassificationRegistry> {
        ClassificationRegistry::from_config(self)
    }

    /// Builds key manager settings from the rotation and retry sections.
    pub fn key_manager_config(&self, registry: &ClassificationRegistry) -> KeyManagerConfig {
        self.rotation.key_manager_config(&self.retry, registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::key::KeyProtection;

    const SAMPLE: &str = r#"
        [rotation]
        critical_days = 30
        sensitive_overlap_days = 14

        [retry]
        max_attempts = 2

        [[classification]]
        entity_type = "Identifier"
        field_name = "Value"
        level = "critical"
        require_hsm = true

        [[classification]]
        entity_type = "Person"
        field_name = "BirthDate"
        level = "Sensitive"
        rotation_interval_days = 60
        require_audit = true
    "#;

    #[test]
    fn parses_toml_with_defaults() {
        let config = CoreConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.rotation.critical_days, 30);
        assert_eq!(config.rotation.sensitive_days, 180);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_delay_ms, RetryPolicy::default().initial_delay_ms);
        assert_eq!(config.audit, AuditConfig::default());

        let registry = config.registry().unwrap();
        let id = registry.lookup("Identifier", "value").unwrap();
        assert_eq!(id.rotation_interval_days(), 30);
        assert!(id.require_hsm());
        assert!(id.require_audit());

        let birth = registry.lookup("Person", "birthdate").unwrap();
        assert_eq!(birth.level(), SensitivityLevel::Sensitive);
        assert_eq!(birth.rotation_interval_days(), 60);
        assert!(birth.require_audit());
    }

    #[test]
    fn key_manager_settings_follow_registry() {
        let config = CoreConfig::from_toml_str(SAMPLE).unwrap();
        let registry = config.registry().unwrap();
        let keys = config.key_manager_config(&registry);

        assert_eq!(keys.overlap(SensitivityLevel::Critical), Duration::days(30));
        assert_eq!(keys.overlap(SensitivityLevel::Sensitive), Duration::days(14));
        assert_eq!(keys.overlap(SensitivityLevel::Internal), Duration::days(365));
        assert_eq!(keys.protection(SensitivityLevel::Critical), KeyProtection::Hsm);
        assert_eq!(keys.protection(SensitivityLevel::Sensitive), KeyProtection::Software);
        assert_eq!(keys.retry().max_attempts, 2);

        assert_eq!(
            config.rotation.interval(SensitivityLevel::Sensitive, &registry),
            Duration::days(60)
        );
    }

    #[test]
    fn parses_json() {
        let json = r#"{
            "classification": [
                { "entity_type": "Account", "field_name": "Number", "level": "critical",
                  "algorithm": "aes-256-gcm" }
            ]
        }"#;
        let config = CoreConfig::from_json_str(json).unwrap();
        assert_eq!(config.classifications[0].algorithm, CipherAlgorithm::Aes256Gcm);
    }

    #[test]
    fn rejects_duplicates_and_bad_values() {
        let dup = r#"
            [[classification]]
            entity_type = "Identifier"
            field_name = "Value"
            level = "critical"

            [[classification]]
            entity_type = "Identifier"
            field_name = "VALUE"
            level = "internal"
        "#;
        let err = CoreConfig::from_toml_str(dup).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

        let cases = [
            "[rotation]\ncritical_days = 0",
            "[rotation]\ninternal_overlap_days = 0",
            "[retry]\nmax_attempts = 0",
            "[audit]\nsensitive_retention_days = 0",
            "[[classification]]\nentity_type = \"A\"\nfield_name = \"b\"\nlevel = \"secret\"",
            "[[classification]]\nentity_type = \"A\"\nfield_name = \"b\"\nlevel = \"critical\"\nalgorithm = \"DES\"",
            "[unknown]\nx = 1",
        ];
        for case in cases {
            let err = CoreConfig::from_toml_str(case).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfiguration, "{}", case);
        }
    }
}
