//! Persistence seams.
//!
//! Field and signer records go through [`RecordStore`]; document bytes (originals and
//! flattened output) go through [`ObjectStore`]. Both ship with in-memory implementations.
//! Object-store calls are wrapped in [`with_retry`] by the engine.

use crate::model::{Field, Signer};
use log::warn;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    NotFound,
    Conflict,
    Unauthorized,
    Invalid,
    Server,
    Timeout,
    RateLimited,
}

impl StorageErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageErrorKind::NotFound => "not found",
            StorageErrorKind::Conflict => "conflict",
            StorageErrorKind::Unauthorized => "unauthorized",
            StorageErrorKind::Invalid => "invalid request",
            StorageErrorKind::Server => "server error",
            StorageErrorKind::Timeout => "timeout",
            StorageErrorKind::RateLimited => "rate limited",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(StorageErrorKind::NotFound, format!("{} not found", what))
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            StorageErrorKind::Server | StorageErrorKind::Timeout | StorageErrorKind::RateLimited
        )
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for StorageError {}

pub trait RecordStore: Send + Sync {
    fn find_fields(&self, document_id: &str) -> Result<Vec<Field>, StorageError>;
    fn find_field(&self, id: &str) -> Result<Option<Field>, StorageError>;
    fn create_field(&self, field: Field) -> Result<Field, StorageError>;
    fn update_field(&self, field: &Field) -> Result<(), StorageError>;
    fn delete_field(&self, id: &str) -> Result<(), StorageError>;
    fn find_signer(&self, document_id: &str) -> Result<Option<Signer>, StorageError>;
    fn create_signer(&self, signer: Signer) -> Result<Signer, StorageError>;
    fn update_signer(&self, signer: &Signer) -> Result<(), StorageError>;
    fn delete_signer(&self, id: &str) -> Result<(), StorageError>;
}

pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, StorageError> {
    mutex
        .lock()
        .map_err(|_| StorageError::new(StorageErrorKind::Server, format!("{} lock poisoned", what)))
}

/// Records kept in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    fields: Mutex<Vec<Field>>,
    signers: Mutex<Vec<Signer>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn find_fields(&self, document_id: &str) -> Result<Vec<Field>, StorageError> {
        let fields = lock(&self.fields, "field table")?;
        Ok(fields
            .iter()
            .filter(|field| field.document_id == document_id)
            .cloned()
            .collect())
    }

    fn find_field(&self, id: &str) -> Result<Option<Field>, StorageError> {
        let fields = lock(&self.fields, "field table")?;
        Ok(fields.iter().find(|field| field.id == id).cloned())
    }

    fn create_field(&self, field: Field) -> Result<Field, StorageError> {
        let mut fields = lock(&self.fields, "field table")?;
        if fields.iter().any(|existing| existing.id == field.id) {
            return Err(StorageError::new(
                StorageErrorKind::Conflict,
                format!("field {} already exists", field.id),
            ));
        }
        fields.push(field.clone());
        Ok(field)
    }

    fn update_field(&self, field: &Field) -> Result<(), StorageError> {
        let mut fields = lock(&self.fields, "field table")?;
        let slot = fields
            .iter_mut()
            .find(|existing| existing.id == field.id)
            .ok_or_else(|| StorageError::not_found(format!("field {}", field.id)))?;
        *slot = field.clone();
        Ok(())
    }

    fn delete_field(&self, id: &str) -> Result<(), StorageError> {
        let mut fields = lock(&self.fields, "field table")?;
        let before = fields.len();
        fields.retain(|field| field.id != id);
        if fields.len() == before {
            return Err(StorageError::not_found(format!("field {}", id)));
        }
        Ok(())
    }

    fn find_signer(&self, document_id: &str) -> Result<Option<Signer>, StorageError> {
        let signers = lock(&self.signers, "signer table")?;
        Ok(signers
            .iter()
            .find(|signer| signer.document_id == document_id)
            .cloned())
    }

    fn create_signer(&self, signer: Signer) -> Result<Signer, StorageError> {
        let mut signers = lock(&self.signers, "signer table")?;
        if signers
            .iter()
            .any(|existing| existing.id == signer.id || existing.document_id == signer.document_id)
        {
            return Err(StorageError::new(
                StorageErrorKind::Conflict,
                format!("document {} already has a signer", signer.document_id),
            ));
        }
        signers.push(signer.clone());
        Ok(signer)
    }

    fn update_signer(&self, signer: &Signer) -> Result<(), StorageError> {
        let mut signers = lock(&self.signers, "signer table")?;
        let slot = signers
            .iter_mut()
            .find(|existing| existing.id == signer.id)
            .ok_or_else(|| StorageError::not_found(format!("signer {}", signer.id)))?;
        *slot = signer.clone();
        Ok(())
    }

    fn delete_signer(&self, id: &str) -> Result<(), StorageError> {
        let mut signers = lock(&self.signers, "signer table")?;
        let before = signers.len();
        signers.retain(|signer| signer.id != id);
        if signers.len() == before {
            return Err(StorageError::not_found(format!("signer {}", id)));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut objects = lock(&self.objects, "object map")?;
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let objects = lock(&self.objects, "object map")?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("object {:?}", key)))
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut objects = lock(&self.objects, "object map")?;
        objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(format!("object {:?}", key)))
    }
}

/// Bounded exponential backoff for retryable storage failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget without sleeping between attempts.
    pub fn no_delay() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

pub fn with_retry<T>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: impl FnMut() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    operation, attempt, max_attempts, err, delay
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
