//! Persistence collaborator.
//!
//! The core does not own a storage schema. It stores protected field values
//! as opaque envelope tokens and reads the classification table once at
//! startup, both through [`PersistenceGateway`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::classification::ClassificationEntry;
use crate::error::{Error, ErrorKind, Result};

/// Address of a stored field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobKey {
    entity_type: String,
    entity_id: String,
    field_name: String,
}

impl BlobKey {
    /// Creates a key. The field name is stored lowercase.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        field_name: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            field_name: field_name.into().to_lowercase(),
        }
    }

    /// Returns the entity type.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Returns the entity id.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Returns the lowercase field name.
    pub fn field_name(&self) -> &str {
        &self.field_name
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.entity_type, self.entity_id, self.field_name)
    }
}

/// Storage backend used by the orchestrator.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Returns the classification table.
    async fn load_classifications(&self) -> Result<Vec<ClassificationEntry>>;

    /// Stores an envelope token.
    async fn put_blob(&self, key: &BlobKey, token: &str) -> Result<()>;

    /// Reads an envelope token, or `None` if nothing is stored.
    async fn get_blob(&self, key: &BlobKey) -> Result<Option<String>>;
}

/// In-memory gateway for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    classifications: Vec<ClassificationEntry>,
    blobs: RwLock<HashMap<BlobKey, String>>,
    unavailable: AtomicBool,
}

impl MemoryPersistence {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that serves `entries` as its classification table.
    pub fn with_classifications(entries: Vec<ClassificationEntry>) -> Self {
        Self {
            classifications: entries,
            ..Self::default()
        }
    }

    /// Makes every call fail with [`ErrorKind::Persistence`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns the number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Persistence, "store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for MemoryPersistence {
    async fn load_classifications(&self) -> Result<Vec<ClassificationEntry>> {
        self.check()?;
        Ok(self.classifications.clone())
    }

    async fn put_blob(&self, key: &BlobKey, token: &str) -> Result<()> {
        self.check()?;
        self.blobs.write().insert(key.clone(), token.to_string());
        Ok(())
    }

    async fn get_blob(&self, key: &BlobKey) -> Result<Option<String>> {
        self.check()?;
        Ok(self.blobs.read().get(key).cloned())
    }
}
