//! Payload tree transformation.
//!
//! [`PayloadTransformer`] walks a JSON payload depth-first and finds every
//! string leaf that sits under a classified property. Planning is pure and
//! fails before any cryptographic work is done; the rewritten tree is only
//! built once every target has a replacement, so a failed call never yields a
//! partially protected payload.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::cipher::EncryptedValue;
use crate::classification::{ClassificationEntry, ClassificationRegistry};
use crate::error::{Error, Result};
use crate::secret::Secret;

/// Which way a payload is being transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Plaintext leaves become envelope tokens.
    Encrypt,
    /// Envelope tokens become plaintext leaves.
    Decrypt,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Encrypt => write!(f, "encrypt"),
            Direction::Decrypt => write!(f, "decrypt"),
        }
    }
}

/// A single leaf selected for transformation.
///
/// The leaf value is held as a [`Secret`] because in the encrypt direction
/// it is plaintext.
#[derive(Debug)]
pub struct FieldTarget {
    pointer: String,
    field_name: String,
    entry: ClassificationEntry,
    value: Secret<String>,
}

impl FieldTarget {
    /// JSON pointer to the leaf.
    pub fn pointer(&self) -> &str {
        &self.pointer
    }

    /// Name of the classified property the leaf belongs to.
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Classification that applies to the leaf.
    pub fn entry(&self) -> &ClassificationEntry {
        &self.entry
    }

    /// Returns the current leaf string.
    ///
    /// For [`Direction::Encrypt`] this is plaintext.
    pub fn expose_value(&self) -> &str {
        self.value.expose_secret()
    }
}

/// Replacement for a planned target.
#[derive(Debug, Clone)]
pub struct FieldReplacement {
    pointer: String,
    value: Value,
}

impl FieldReplacement {
    /// Creates a replacement for the leaf at `pointer`.
    pub fn new(pointer: impl Into<String>, value: Value) -> Self {
        Self {
            pointer: pointer.into(),
            value,
        }
    }
}

/// Plans and applies classified-leaf substitutions over JSON payloads.
#[derive(Debug, Clone)]
pub struct PayloadTransformer {
    registry: Arc<ClassificationRegistry>,
}

impl PayloadTransformer {
    /// Creates a transformer over `registry`.
    pub fn new(registry: Arc<ClassificationRegistry>) -> Self {
        Self { registry }
    }

    /// Collects every leaf of `payload` that must be transformed.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::UnsupportedFieldType`](crate::ErrorKind::UnsupportedFieldType)
    ///   if a classified property holds a number, boolean, null, or object
    /// - [`ErrorKind::MalformedEnvelope`](crate::ErrorKind::MalformedEnvelope)
    ///   if decrypting and a classified leaf is not an envelope token
    pub fn plan(
        &self,
        payload: &Value,
        entity_type: &str,
        direction: Direction,
    ) -> Result<Vec<FieldTarget>> {
        let mut planner = Planner {
            registry: &self.registry,
            entity_type,
            direction,
            targets: Vec::new(),
        };
        planner.walk(payload, String::new())?;
        Ok(planner.targets)
    }

    /// Returns a copy of `payload` with each replacement substituted.
    ///
    /// Everything not named by a replacement is copied unchanged, including
    /// object key order.
    pub fn apply(&self, payload: &Value, replacements: Vec<FieldReplacement>) -> Result<Value> {
        let mut output = payload.clone();
        for replacement in replacements {
            let slot = output.pointer_mut(&replacement.pointer).ok_or_else(|| {
                Error::invalid_config(format!("no leaf at pointer '{}'", replacement.pointer))
            })?;
            *slot = replacement.value;
        }
        Ok(output)
    }
}

struct Planner<'a> {
    registry: &'a ClassificationRegistry,
    entity_type: &'a str,
    direction: Direction,
    targets: Vec<FieldTarget>,
}

impl Planner<'_> {
    fn walk(&mut self, value: &Value, pointer: String) -> Result<()> {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let child_pointer = push_pointer(&pointer, key);
                    match self.registry.find(self.entity_type, key) {
                        Some(entry) => self.classified(child, child_pointer, key, entry)?,
                        None => self.walk(child, child_pointer)?,
                    }
                }
                Ok(())
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.walk(item, push_pointer(&pointer, &index.to_string()))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn classified(
        &mut self,
        value: &Value,
        pointer: String,
        field_name: &str,
        entry: &ClassificationEntry,
    ) -> Result<()> {
        match value {
            Value::String(text) => self.target(text, pointer, field_name, entry),
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    let item_pointer = push_pointer(&pointer, &index.to_string());
                    match item {
                        Value::Object(_) => self.walk(item, item_pointer)?,
                        _ => self.classified(item, item_pointer, field_name, entry)?,
                    }
                }
                Ok(())
            }
            other => Err(Error::unsupported_field_type(kind_of(other))
                .with_entity_type(self.entity_type)
                .with_field(field_name)),
        }
    }

    fn target(
        &mut self,
        text: &str,
        pointer: String,
        field_name: &str,
        entry: &ClassificationEntry,
    ) -> Result<()> {
        if self.direction == Direction::Decrypt && !EncryptedValue::is_token(text) {
            return Err(Error::malformed_envelope("classified value is not an envelope")
                .with_entity_type(self.entity_type)
                .with_field(field_name));
        }
        self.targets.push(FieldTarget {
            pointer,
            field_name: field_name.to_string(),
            entry: entry.clone(),
            value: Secret::new(text.to_string()),
        });
        Ok(())
    }
}

fn push_pointer(base: &str, token: &str) -> String {
    let escaped = token.replace('~', "~0").replace('/', "~1");
    format!("{}/{}", base, escaped)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
