use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use hopline_core::JobId;

use super::{AuditError, AuditRecord, AuditStore};

/// Audit trail held in a key-ordered map.
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    records: RwLock<BTreeMap<String, AuditRecord>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn record(&self, record: &AuditRecord) -> Result<String, AuditError> {
        let key = record.key();
        let mut records = self
            .records
            .write()
            .map_err(|_| AuditError::Storage("lock poisoned".to_string()))?;
        if records.contains_key(&key) {
            return Err(AuditError::AlreadyExists(key));
        }
        records.insert(key.clone(), record.clone());
        Ok(key)
    }

    async fn for_job(&self, job_id: &JobId) -> Result<Vec<AuditRecord>, AuditError> {
        let records = self
            .records
            .read()
            .map_err(|_| AuditError::Storage("lock poisoned".to_string()))?;
        let prefix = format!("{job_id}/");
        Ok(records
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, record)| record.clone())
            .collect())
    }
}
