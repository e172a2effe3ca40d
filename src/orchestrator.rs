//! The encryption orchestrator.
//!
//! Every call follows the same pipeline: classify, resolve the key,
//! transform, audit, return. Nothing is returned to the caller until the
//! audit batch for the call has been handed to the trail.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::audit::{
    AuditConfig, AuditOperation, AuditRecord, AuditSink, AuditTrail, ChainVerification,
    Severity, TracingAuditSink, WritePolicy, GENESIS_HASH,
};
use crate::cipher::{EncryptedValue, FieldCipher};
use crate::classification::{ClassificationEntry, ClassificationRegistry, SensitivityLevel};
use crate::config::{CoreConfig, RotationConfig};
use crate::context::OperationContext;
use crate::error::{Error, ErrorKind, Result};
use crate::key::{KeyManager, KeyManagerConfig, KeyProviderGateway, KeyVersion, KeyVersionId};
use crate::persistence::{BlobKey, PersistenceGateway};
use crate::retry::RetryPolicy;
use crate::secret::Secret;
use crate::transform::{Direction, FieldReplacement, FieldTarget, PayloadTransformer};

/// Maps a failure to the audit operation that records it.
fn failure_operation(default: AuditOperation, kind: ErrorKind) -> AuditOperation {
    match kind {
        ErrorKind::ProviderTransient | ErrorKind::ProviderPermanent => {
            AuditOperation::ProviderFailure
        }
        ErrorKind::NotClassified | ErrorKind::UnsupportedFieldType => {
            AuditOperation::ClassificationViolation
        }
        _ => default,
    }
}

/// Field-level encryption and audit façade.
///
/// Shared across tasks behind an `Arc`; every method takes `&self`.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use fieldguard_core::{
///     ClassificationEntry, ClassificationRegistry, EncryptionOrchestrator, LocalKeyProvider,
///     OperationContext, SensitivityLevel,
/// };
/// use fieldguard_core::audit::MemoryAuditSink;
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let registry = ClassificationRegistry::from_entries(vec![
///     ClassificationEntry::new("Identifier", "Value", SensitivityLevel::Critical),
/// ])
/// .unwrap();
/// let sink = Arc::new(MemoryAuditSink::new());
///
/// let core = EncryptionOrchestrator::builder()
///     .registry(registry)
///     .provider(Arc::new(LocalKeyProvider::new()))
///     .audit_sink(sink.clone())
///     .build()
///     .unwrap();
///
/// let ctx = OperationContext::new("Identifier", "clerk");
/// core.provision_keys(&ctx).await.unwrap();
///
/// let envelope = core.encrypt_field("A1234567", "Value", &ctx).await.unwrap();
/// let plain = core.decrypt_field(&envelope, "Value", &ctx).await.unwrap();
/// assert_eq!(plain.expose_secret(), "A1234567");
/// # });
/// ```
pub struct EncryptionOrchestrator {
    registry: Arc<ClassificationRegistry>,
    keys: Arc<KeyManager>,
    cipher: FieldCipher,
    transformer: PayloadTransformer,
    audit: AuditTrail,
    rotation: RotationConfig,
    persistence: Option<Arc<dyn PersistenceGateway>>,
}

impl std::fmt::Debug for EncryptionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionOrchestrator")
            .field("classifications", &self.registry.len())
            .field("keys", &self.keys)
            .field("audit", &self.audit)
            .field("persistence", &self.persistence.is_some())
            .finish()
    }
}

impl EncryptionOrchestrator {
    /// Starts building an orchestrator.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Returns the classification registry.
    pub fn registry(&self) -> &ClassificationRegistry {
        &self.registry
    }

    /// Returns the key manager.
    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Returns the audit trail.
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Encrypts a single field value.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::NotClassified`] if the field has no entry; nothing is audited
    /// - [`ErrorKind::KeyUnavailable`] if the level has no Active key
    /// - [`ErrorKind::ProviderPermanent`] once provider retries are exhausted
    /// - [`ErrorKind::AuditWriteFailure`] if a required audit write fails
    pub async fn encrypt_field(
        &self,
        value: &str,
        field_name: &str,
        ctx: &OperationContext,
    ) -> Result<EncryptedValue> {
        let entry = self.classify(field_name, ctx)?;
        let outcome = self
            .cipher
            .encrypt(value, entry, ctx.entity_type(), field_name)
            .await;

        match outcome {
            Ok(envelope) => {
                let record = AuditRecord::new(AuditOperation::Encrypt, ctx)
                    .with_field(field_name)
                    .with_classification(entry.level())
                    .with_key_version(envelope.key_version_id().clone());
                self.write_audit(vec![record], WritePolicy::for_entry(entry), ctx)
                    .await?;
                ctx.log().debug(format_args!(
                    "encrypted field '{}' with {}",
                    field_name,
                    envelope.key_version_id()
                ));
                Ok(envelope)
            }
            Err(err) => {
                self.audit_failure(AuditOperation::Encrypt, &err, Some(field_name), Some(entry), None, ctx)
                    .await;
                Err(err.with_correlation_id(ctx.correlation_id()))
            }
        }
    }

    /// Decrypts a single field value with the key version it names.
    ///
    /// # Errors
    ///
    /// As [`encrypt_field`](Self::encrypt_field), plus
    /// [`ErrorKind::KeyExpired`] and [`ErrorKind::MalformedEnvelope`].
    pub async fn decrypt_field(
        &self,
        envelope: &EncryptedValue,
        field_name: &str,
        ctx: &OperationContext,
    ) -> Result<Secret<String>> {
        let entry = self.classify(field_name, ctx)?;
        let key_version = envelope.key_version_id().clone();
        let outcome = self
            .cipher
            .decrypt(envelope, entry, ctx.entity_type(), field_name)
            .await;

        match outcome {
            Ok(plain) => {
                let record = AuditRecord::new(AuditOperation::Decrypt, ctx)
                    .with_field(field_name)
                    .with_classification(entry.level())
                    .with_key_version(key_version);
                self.write_audit(vec![record], WritePolicy::for_entry(entry), ctx)
                    .await?;
                Ok(plain)
            }
            Err(err) => {
                self.audit_failure(
                    AuditOperation::Decrypt,
                    &err,
                    Some(field_name),
                    Some(entry),
                    Some(key_version),
                    ctx,
                )
                .await;
                Err(err.with_correlation_id(ctx.correlation_id()))
            }
        }
    }

    /// Encrypts every classified leaf of `payload`.
    ///
    /// The returned tree has the same shape and key order; only classified
    /// string leaves are replaced with envelope tokens. On any failure no
    /// tree is returned and exactly one Failure record is written.
    pub async fn encrypt_entity(
        &self,
        payload: &Value,
        entity_type: &str,
        ctx: &OperationContext,
    ) -> Result<Value> {
        self.transform_entity(payload, entity_type, Direction::Encrypt, ctx)
            .await
    }

    /// Decrypts every classified leaf of `payload`.
    pub async fn decrypt_entity(
        &self,
        payload: &Value,
        entity_type: &str,
        ctx: &OperationContext,
    ) -> Result<Value> {
        self.transform_entity(payload, entity_type, Direction::Decrypt, ctx)
            .await
    }

    /// Rotates the key of `level`.
    ///
    /// The rotation is audited at High severity before the new key becomes
    /// visible; if the audit write fails the rotation is abandoned.
    pub async fn rotate_key(
        &self,
        level: SensitivityLevel,
        ctx: &OperationContext,
    ) -> Result<KeyVersion> {
        let pending = match self.keys.prepare_rotation(level, Utc::now()).await {
            Ok(pending) => pending,
            Err(err) => {
                let record = AuditRecord::new(failure_operation(AuditOperation::KeyRotation, err.kind()), ctx)
                    .with_classification(level)
                    .with_severity(Severity::High)
                    .failed(err.kind());
                if let Err(audit_err) = self.audit.record(vec![record], WritePolicy::Blocking).await {
                    ctx.log().error(format_args!(
                        "failed rotation of {} could not be audited: {}",
                        level, audit_err
                    ));
                }
                return Err(err.with_correlation_id(ctx.correlation_id()));
            }
        };

        let record = AuditRecord::new(AuditOperation::KeyRotation, ctx)
            .with_classification(level)
            .with_severity(Severity::High)
            .with_key_version(pending.key().id().clone());
        self.write_audit(vec![record], WritePolicy::Blocking, ctx)
            .await?;

        let previous = pending
            .previous_active()
            .map_or_else(|| "none".to_string(), ToString::to_string);
        let key = pending.commit();
        ctx.log().info(format_args!(
            "rotated {} from {} to {}",
            level,
            previous,
            key.id()
        ));
        Ok(key)
    }

    /// Rotates every classified level that has no Active key yet.
    pub async fn provision_keys(&self, ctx: &OperationContext) -> Result<Vec<KeyVersion>> {
        let mut created = Vec::new();
        for level in self.registry.levels() {
            if self.keys.resolve_encrypt_key(level).is_err() {
                created.push(self.rotate_key(level, ctx).await?);
            }
        }
        Ok(created)
    }

    /// Rotates every classified level whose Active key is older than its
    /// rotation interval at `now`.
    pub async fn rotate_due_keys(
        &self,
        ctx: &OperationContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<KeyVersion>> {
        let mut rotated = Vec::new();
        for level in self.registry.levels() {
            let interval = self.rotation.interval(level, &self.registry);
            if self.keys.rotation_due(level, interval, now) {
                rotated.push(self.rotate_key(level, ctx).await?);
            }
        }
        Ok(rotated)
    }

    /// Retires keys whose overlap window closed before `now`.
    pub fn retire_expired(&self, now: DateTime<Utc>) -> Vec<KeyVersionId> {
        self.keys.retire_expired(now)
    }

    /// Encrypts a field and stores the envelope through the persistence
    /// gateway, keyed by the context's entity id.
    pub async fn store_field(
        &self,
        value: &str,
        field_name: &str,
        ctx: &OperationContext,
    ) -> Result<EncryptedValue> {
        let (store, key) = self.blob_target(field_name, ctx)?;
        let envelope = self.encrypt_field(value, field_name, ctx).await?;
        store
            .put_blob(&key, &envelope.to_token()?)
            .await
            .map_err(|e| e.with_correlation_id(ctx.correlation_id()))?;
        Ok(envelope)
    }

    /// Loads and decrypts a stored field, or `None` if nothing is stored.
    pub async fn load_field(
        &self,
        field_name: &str,
        ctx: &OperationContext,
    ) -> Result<Option<Secret<String>>> {
        let (store, key) = self.blob_target(field_name, ctx)?;
        let token = match store
            .get_blob(&key)
            .await
            .map_err(|e| e.with_correlation_id(ctx.correlation_id()))?
        {
            Some(token) => token,
            None => return Ok(None),
        };
        let envelope = EncryptedValue::from_token(&token)
            .map_err(|e| e.with_field(field_name).with_correlation_id(ctx.correlation_id()))?;
        self.decrypt_field(&envelope, field_name, ctx).await.map(Some)
    }

    /// Verifies a trail exported from the audit sink, starting at genesis.
    pub fn verify_audit_chain(&self, records: &[AuditRecord]) -> ChainVerification {
        AuditTrail::verify_chain(records, GENESIS_HASH)
    }

    fn classify(&self, field_name: &str, ctx: &OperationContext) -> Result<&ClassificationEntry> {
        self.registry
            .lookup(ctx.entity_type(), field_name)
            .map_err(|err| {
                ctx.log()
                    .warn(format_args!("field '{}' is not classified", field_name));
                err.with_correlation_id(ctx.correlation_id())
            })
    }

    fn blob_target(
        &self,
        field_name: &str,
        ctx: &OperationContext,
    ) -> Result<(&Arc<dyn PersistenceGateway>, BlobKey)> {
        let store = self.persistence.as_ref().ok_or_else(|| {
            Error::invalid_config("no persistence gateway configured")
                .with_correlation_id(ctx.correlation_id())
        })?;
        let entity_id = ctx.entity_id().ok_or_else(|| {
            Error::invalid_config("context has no entity id")
                .with_entity_type(ctx.entity_type())
                .with_correlation_id(ctx.correlation_id())
        })?;
        Ok((store, BlobKey::new(ctx.entity_type(), entity_id, field_name)))
    }

    async fn transform_entity(
        &self,
        payload: &Value,
        entity_type: &str,
        direction: Direction,
        ctx: &OperationContext,
    ) -> Result<Value> {
        let ctx = ctx.for_entity_type(entity_type);
        let operation = match direction {
            Direction::Encrypt => AuditOperation::Encrypt,
            Direction::Decrypt => AuditOperation::Decrypt,
        };

        let targets = match self.transformer.plan(payload, entity_type, direction) {
            Ok(targets) => targets,
            Err(err) => {
                let field = err.context().field_name.clone();
                let entry = field
                    .as_deref()
                    .and_then(|f| self.registry.find(entity_type, f));
                self.audit_failure(
                    AuditOperation::ClassificationViolation,
                    &err,
                    field.as_deref(),
                    entry,
                    None,
                    &ctx,
                )
                .await;
                return Err(err.with_correlation_id(ctx.correlation_id()));
            }
        };

        if targets.is_empty() {
            return Ok(payload.clone());
        }

        let mut replacements = Vec::with_capacity(targets.len());
        let mut records = Vec::with_capacity(targets.len());
        let mut policy = WritePolicy::BestEffort;

        for target in &targets {
            let sealed = match direction {
                Direction::Encrypt => self.encrypt_target(target, entity_type).await,
                Direction::Decrypt => self.decrypt_target(target, entity_type).await,
            };
            match sealed {
                Ok((replacement, key_version)) => {
                    replacements.push(replacement);
                    records.push(
                        AuditRecord::new(operation, &ctx)
                            .with_field(target.field_name())
                            .with_classification(target.entry().level())
                            .with_key_version(key_version),
                    );
                    policy = policy.stricter(WritePolicy::for_entry(target.entry()));
                }
                Err(err) => {
                    self.audit_failure(
                        operation,
                        &err,
                        Some(target.field_name()),
                        Some(target.entry()),
                        None,
                        &ctx,
                    )
                    .await;
                    return Err(err.with_correlation_id(ctx.correlation_id()));
                }
            }
        }

        let output = self
            .transformer
            .apply(payload, replacements)
            .map_err(|e| e.with_correlation_id(ctx.correlation_id()))?;
        let count = records.len();
        self.write_audit(records, policy, &ctx).await?;

        ctx.log().info(format_args!(
            "{} {} field(s) of {}",
            direction, count, entity_type
        ));
        Ok(output)
    }

    async fn encrypt_target(
        &self,
        target: &FieldTarget,
        entity_type: &str,
    ) -> Result<(FieldReplacement, KeyVersionId)> {
        let envelope = self
            .cipher
            .encrypt(target.expose_value(), target.entry(), entity_type, target.field_name())
            .await?;
        let token = envelope.to_token()?;
        Ok((
            FieldReplacement::new(target.pointer(), Value::String(token)),
            envelope.key_version_id().clone(),
        ))
    }

    async fn decrypt_target(
        &self,
        target: &FieldTarget,
        entity_type: &str,
    ) -> Result<(FieldReplacement, KeyVersionId)> {
        let envelope = EncryptedValue::from_token(target.expose_value())
            .map_err(|e| e.with_entity_type(entity_type).with_field(target.field_name()))?;
        let plain = self
            .cipher
            .decrypt(&envelope, target.entry(), entity_type, target.field_name())
            .await?;
        Ok((
            FieldReplacement::new(target.pointer(), Value::String(plain.expose_secret().clone())),
            envelope.key_version_id().clone(),
        ))
    }

    async fn write_audit(
        &self,
        records: Vec<AuditRecord>,
        policy: WritePolicy,
        ctx: &OperationContext,
    ) -> Result<()> {
        self.audit
            .record(records, policy)
            .await
            .map_err(|e| e.with_entity_type(ctx.entity_type()).with_correlation_id(ctx.correlation_id()))
    }

    /// Writes the single Failure record for a failed call.
    ///
    /// The caller returns the original error; a failure to audit it is
    /// logged.
    async fn audit_failure(
        &self,
        operation: AuditOperation,
        err: &Error,
        field_name: Option<&str>,
        entry: Option<&ClassificationEntry>,
        key_version: Option<KeyVersionId>,
        ctx: &OperationContext,
    ) {
        let mut record =
            AuditRecord::new(failure_operation(operation, err.kind()), ctx).failed(err.kind());
        if let Some(field) = field_name {
            record = record.with_field(field);
        }
        if let Some(entry) = entry {
            record = record.with_classification(entry.level());
        }
        if let Some(id) = key_version {
            record = record.with_key_version(id);
        }
        let policy = entry.map_or(WritePolicy::BestEffort, WritePolicy::for_entry);

        ctx.log().warn(format_args!(
            "{} failed on field '{}': {}",
            operation,
            field_name.unwrap_or("-"),
            err.kind()
        ));
        if let Err(audit_err) = self.audit.record(vec![record], policy).await {
            ctx.log()
                .error(format_args!("failure could not be audited: {}", audit_err));
        }
    }
}

/// Builder for [`EncryptionOrchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    registry: Option<ClassificationRegistry>,
    provider: Option<Arc<dyn KeyProviderGateway>>,
    key_manager: Option<Arc<KeyManager>>,
    key_config: Option<KeyManagerConfig>,
    sink: Option<Arc<dyn AuditSink>>,
    audit_config: AuditConfig,
    retry: RetryPolicy,
    rotation: RotationConfig,
    persistence: Option<Arc<dyn PersistenceGateway>>,
}

impl OrchestratorBuilder {
    /// Applies every section of a loaded config, including its
    /// classification table.
    pub fn config(mut self, config: &CoreConfig) -> Result<Self> {
        let registry = config.registry()?;
        self.key_config = Some(config.key_manager_config(&registry));
        self.registry = Some(registry);
        self.audit_config = config.audit.clone();
        self.retry = config.retry.clone();
        self.rotation = config.rotation.clone();
        Ok(self)
    }

    /// Sets the classification registry.
    pub fn registry(mut self, registry: ClassificationRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the key provider; a key manager is created for it.
    pub fn provider(mut self, provider: Arc<dyn KeyProviderGateway>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Uses an existing key manager instead of creating one.
    pub fn key_manager(mut self, keys: Arc<KeyManager>) -> Self {
        self.key_manager = Some(keys);
        self
    }

    /// Overrides the derived key manager settings.
    pub fn key_config(mut self, config: KeyManagerConfig) -> Self {
        self.key_config = Some(config);
        self
    }

    /// Sets the audit sink. Defaults to [`TracingAuditSink`].
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets audit retention.
    pub fn audit_config(mut self, config: AuditConfig) -> Self {
        self.audit_config = config;
        self
    }

    /// Sets the retry policy for provider calls and audit retries.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the rotation schedule.
    pub fn rotation(mut self, rotation: RotationConfig) -> Self {
        self.rotation = rotation;
        self
    }

    /// Sets the persistence gateway used by `store_field` / `load_field`.
    pub fn persistence(mut self, persistence: Arc<dyn PersistenceGateway>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfiguration`] if no registry, or neither
    /// a provider nor a key manager, was supplied.
    pub fn build(self) -> Result<EncryptionOrchestrator> {
        let registry = Arc::new(
            self.registry
                .ok_or_else(|| Error::invalid_config("orchestrator needs a classification registry"))?,
        );

        let keys = match (self.key_manager, self.provider) {
            (Some(keys), _) => keys,
            (None, Some(provider)) => {
                let config = self
                    .key_config
                    .unwrap_or_else(|| self.rotation.key_manager_config(&self.retry, &registry));
                Arc::new(KeyManager::new(provider, config))
            }
            (None, None) => {
                return Err(Error::invalid_config(
                    "orchestrator needs a key provider or key manager",
                ))
            }
        };

        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(TracingAuditSink::new()));
        let audit = AuditTrail::new(sink)
            .with_config(self.audit_config)
            .with_retry(self.retry);

        tracing::info!(
            classifications = registry.len(),
            provider = keys.provider().name(),
            persistence = self.persistence.is_some(),
            "encryption orchestrator ready"
        );

        Ok(EncryptionOrchestrator {
            cipher: FieldCipher::new(Arc::clone(&keys)),
            transformer: PayloadTransformer::new(Arc::clone(&registry)),
            registry,
            keys,
            audit,
            rotation: self.rotation,
            persistence: self.persistence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditOutcome, MemoryAuditSink};
    use crate::key::{
        KeyHandle, KeyProtection, LocalKeyProvider, ProviderError, ProviderErrorKind,
        SealedPayload,
    };
    use crate::persistence::MemoryPersistence;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Local provider that fails encrypt calls on demand.
    #[derive(Default)]
    struct FlakyProvider {
        inner: LocalKeyProvider,
        transient_failures: AtomicU32,
        permanent: AtomicBool,
        encrypt_calls: AtomicU32,
    }

    #[async_trait]
    impl KeyProviderGateway for FlakyProvider {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn wrap_key(
            &self,
            level: SensitivityLevel,
            protection: KeyProtection,
        ) -> std::result::Result<KeyHandle, ProviderError> {
            self.inner.wrap_key(level, protection).await
        }

        async fn encrypt(
            &self,
            handle: &KeyHandle,
            plaintext: &[u8],
            aad: &[u8],
        ) -> std::result::Result<SealedPayload, ProviderError> {
            self.encrypt_calls.fetch_add(1, Ordering::SeqCst);
            if self.permanent.load(Ordering::SeqCst) {
                return Err(ProviderError::new(ProviderErrorKind::Unauthorized, "denied"));
            }
            let remaining = self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if remaining.is_ok() {
                return Err(ProviderError::new(ProviderErrorKind::Throttled, "slow down"));
            }
            self.inner.encrypt(handle, plaintext, aad).await
        }

        async fn decrypt(
            &self,
            handle: &KeyHandle,
            sealed: &SealedPayload,
            aad: &[u8],
        ) -> std::result::Result<Secret<Vec<u8>>, ProviderError> {
            self.inner.decrypt(handle, sealed, aad).await
        }
    }

    struct Fixture {
        core: EncryptionOrchestrator,
        sink: Arc<MemoryAuditSink>,
        provider: Arc<FlakyProvider>,
        store: Arc<MemoryPersistence>,
    }

    fn registry() -> ClassificationRegistry {
        ClassificationRegistry::from_entries(vec![
            ClassificationEntry::new("Identifier", "Value", SensitivityLevel::Critical),
            ClassificationEntry::new("Person", "BirthDate", SensitivityLevel::Sensitive),
            ClassificationEntry::new("Person", "Notes", SensitivityLevel::Internal),
        ])
        .unwrap()
    }

    async fn fixture() -> Fixture {
        let sink = Arc::new(MemoryAuditSink::new());
        let provider = Arc::new(FlakyProvider::default());
        let store = Arc::new(MemoryPersistence::new());
        let core = EncryptionOrchestrator::builder()
            .registry(registry())
            .provider(provider.clone())
            .audit_sink(sink.clone())
            .persistence(store.clone())
            .retry(RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                ..RetryPolicy::default()
            })
            .build()
            .unwrap();
        core.provision_keys(&OperationContext::new("Identifier", "setup"))
            .await
            .unwrap();
        sink.clear();
        Fixture {
            core,
            sink,
            provider,
            store,
        }
    }

    #[test]
    fn builder_requires_registry_and_keys() {
        let err = EncryptionOrchestrator::builder().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

        let err = EncryptionOrchestrator::builder()
            .registry(registry())
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[tokio::test]
    async fn provision_creates_one_key_per_classified_level() {
        let f = fixture().await;
        assert_eq!(f.core.keys().active_levels(), SensitivityLevel::ALL.to_vec());

        let again = f
            .core
            .provision_keys(&OperationContext::new("Identifier", "setup"))
            .await
            .unwrap();
        assert!(again.is_empty());
        assert!(f.sink.is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let f = fixture().await;
        f.provider.transient_failures.store(2, Ordering::SeqCst);
        let ctx = OperationContext::new("Identifier", "clerk");

        f.core.encrypt_field("A1234567", "Value", &ctx).await.unwrap();
        assert_eq!(f.provider.encrypt_calls.load(Ordering::SeqCst), 3);

        let records = f.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome(), AuditOutcome::Success);
    }

    #[tokio::test]
    async fn exhausted_retries_are_audited_as_provider_failure() {
        let f = fixture().await;
        f.provider.transient_failures.store(10, Ordering::SeqCst);
        let ctx = OperationContext::new("Identifier", "clerk");

        let err = f.core.encrypt_field("A1234567", "Value", &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderPermanent);
        assert_eq!(err.context().correlation_id.as_deref(), Some(ctx.correlation_id()));
        assert_eq!(f.provider.encrypt_calls.load(Ordering::SeqCst), 3);

        let records = f.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation(), AuditOperation::ProviderFailure);
        assert_eq!(records[0].error_kind(), Some(ErrorKind::ProviderPermanent));
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let f = fixture().await;
        f.provider.permanent.store(true, Ordering::SeqCst);
        let ctx = OperationContext::new("Identifier", "clerk");

        let err = f.core.encrypt_field("x", "Value", &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderPermanent);
        assert_eq!(f.provider.encrypt_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn critical_audit_failure_fails_the_call() {
        let f = fixture().await;
        f.sink.fail_next(1);
        let ctx = OperationContext::new("Identifier", "clerk");

        let err = f.core.encrypt_field("A1234567", "Value", &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuditWriteFailure);
        assert!(f.sink.is_empty());
    }

    #[tokio::test]
    async fn internal_audit_failure_is_best_effort() {
        let f = fixture().await;
        f.sink.fail_next(1);
        let ctx = OperationContext::new("Person", "clerk");

        f.core.encrypt_field("likes tea", "Notes", &ctx).await.unwrap();
        for _ in 0..200 {
            if f.core.audit().pending_retries() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(f.sink.len(), 1);
    }

    #[tokio::test]
    async fn entity_failure_writes_one_record_and_no_tree() {
        let f = fixture().await;
        f.provider.permanent.store(true, Ordering::SeqCst);
        let ctx = OperationContext::new("Person", "clerk");
        let payload = json!({ "BirthDate": "1970-01-01", "Notes": "n" });

        let err = f.core.encrypt_entity(&payload, "Person", &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderPermanent);

        let records = f.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome(), AuditOutcome::Failure);
        assert_eq!(records[0].field_name(), Some("BirthDate"));
    }

    #[tokio::test]
    async fn unsupported_type_is_a_classification_violation() {
        let f = fixture().await;
        let ctx = OperationContext::new("Person", "clerk");
        let payload = json!({ "BirthDate": 19700101 });

        let err = f.core.encrypt_entity(&payload, "Person", &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFieldType);

        let records = f.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation(), AuditOperation::ClassificationViolation);
        assert_eq!(records[0].classification(), Some(SensitivityLevel::Sensitive));
    }

    #[tokio::test]
    async fn rotation_aborts_when_audit_fails() {
        let f = fixture().await;
        let ctx = OperationContext::new("Identifier", "admin");
        let before = f.core.keys().resolve_encrypt_key(SensitivityLevel::Critical).unwrap();

        f.sink.fail_next(1);
        let err = f
            .core
            .rotate_key(SensitivityLevel::Critical, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuditWriteFailure);
        assert_eq!(
            f.core.keys().resolve_encrypt_key(SensitivityLevel::Critical).unwrap().id(),
            before.id()
        );

        let key = f.core.rotate_key(SensitivityLevel::Critical, &ctx).await.unwrap();
        assert_eq!(key.version(), before.version() + 1);
        let records = f.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation(), AuditOperation::KeyRotation);
        assert_eq!(records[0].severity(), Severity::High);
        assert_eq!(records[0].key_version_id(), Some(key.id()));
    }

    #[tokio::test]
    async fn rotate_due_keys_uses_intervals() {
        let f = fixture().await;
        let ctx = OperationContext::new("Identifier", "scheduler");

        assert!(f.core.rotate_due_keys(&ctx, Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::days(100);
        let rotated = f.core.rotate_due_keys(&ctx, later).await.unwrap();
        let levels: Vec<_> = rotated.iter().map(KeyVersion::level).collect();
        assert_eq!(levels, vec![SensitivityLevel::Critical]);
    }

    #[tokio::test]
    async fn store_and_load_through_persistence() {
        let f = fixture().await;
        let ctx = OperationContext::new("Identifier", "clerk").with_entity_id("id-1");

        f.core.store_field("A1234567", "Value", &ctx).await.unwrap();
        assert_eq!(f.store.blob_count(), 1);

        let loaded = f.core.load_field("value", &ctx).await.unwrap().unwrap();
        assert_eq!(loaded.expose_secret(), "A1234567");

        let other = OperationContext::new("Identifier", "clerk").with_entity_id("id-2");
        assert!(f.core.load_field("Value", &other).await.unwrap().is_none());

        let no_id = OperationContext::new("Identifier", "clerk");
        let err = f.core.store_field("x", "Value", &no_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[tokio::test]
    async fn audit_chain_verifies() {
        let f = fixture().await;
        let ctx = OperationContext::new("Identifier", "clerk");
        for value in ["a", "b", "c"] {
            f.core.encrypt_field(value, "Value", &ctx).await.unwrap();
        }
        // Provisioning records were cleared, so this slice starts mid-chain.
        let records = f.sink.records();
        let verification = AuditTrail::verify_chain(&records, records[0].prev_hash());
        assert!(verification.is_valid());
        assert!(!f.core.verify_audit_chain(&records).chain_intact);
    }
}
