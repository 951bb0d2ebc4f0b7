//! Transaction log seam
//!
//! Every mutation the engine applies is described by a [`Transaction`] and
//! handed to a [`TransactionLog`] (unless the caller opted out through
//! `WriteOptions::log_txn`). Replication and audit consume that log; the
//! engine itself only produces it.

use dostore_common::{Timestamp, TxnMetadata};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of mutation recorded
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxnAction {
    ObjectAdd,
    ObjectDel,
    DataUpdate,
    DataDel,
    AttributeUpdate,
    AttributeDelete,
}

impl TxnAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ObjectAdd => "object-add",
            Self::ObjectDel => "object-del",
            Self::DataUpdate => "data-update",
            Self::DataDel => "data-del",
            Self::AttributeUpdate => "attribute-update",
            Self::AttributeDelete => "attribute-delete",
        }
    }
}

impl fmt::Display for TxnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged mutation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub action: TxnAction,
    pub object_id: String,
    pub element_id: Option<String>,
    /// Event time the mutation was stamped with
    pub timestamp: Timestamp,
    /// Effective time actually recorded (may differ from `timestamp`
    /// when the clock-skew guard adjusted a deletion)
    pub actual_time: Timestamp,
    /// Attributes written or keys deleted, for attribute actions
    pub attributes: BTreeMap<String, String>,
    /// Caller context, passed through untouched
    pub metadata: TxnMetadata,
}

impl Transaction {
    #[must_use]
    pub fn new(action: TxnAction, object_id: &str, timestamp: Timestamp) -> Self {
        Self {
            action,
            object_id: object_id.to_string(),
            element_id: None,
            timestamp,
            actual_time: timestamp,
            attributes: BTreeMap::new(),
            metadata: TxnMetadata::new(),
        }
    }

    #[must_use]
    pub fn element(mut self, element_id: Option<&str>) -> Self {
        self.element_id = element_id.map(str::to_string);
        self
    }

    #[must_use]
    pub const fn actual_time(mut self, actual_time: Timestamp) -> Self {
        self.actual_time = actual_time;
        self
    }

    #[must_use]
    pub fn attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: TxnMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Consumer of engine mutations.
///
/// Implementations must be cheap to call from inside object-locked
/// sections and must not call back into the engine.
pub trait TransactionLog: Send + Sync {
    fn add_transaction(&self, txn: Transaction) -> dostore_common::Result<()>;
}

/// Log that drops everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTransactionLog;

impl TransactionLog for NullTransactionLog {
    fn add_transaction(&self, _txn: Transaction) -> dostore_common::Result<()> {
        Ok(())
    }
}

/// Log that keeps transactions in memory
#[derive(Debug, Default)]
pub struct MemoryTransactionLog {
    entries: Mutex<Vec<Transaction>>,
}

impl MemoryTransactionLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything logged so far
    #[must_use]
    pub fn transactions(&self) -> Vec<Transaction> {
        self.entries.lock().clone()
    }

    /// Remove and return everything logged so far
    pub fn drain(&self) -> Vec<Transaction> {
        std::mem::take(&mut *self.entries.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl TransactionLog for MemoryTransactionLog {
    fn add_transaction(&self, txn: Transaction) -> dostore_common::Result<()> {
        self.entries.lock().push(txn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names() {
        assert_eq!(TxnAction::ObjectAdd.to_string(), "object-add");
        assert_eq!(TxnAction::AttributeDelete.as_str(), "attribute-delete");
        assert_eq!(
            serde_json::to_string(&TxnAction::DataUpdate).unwrap(),
            "\"data-update\""
        );
    }

    #[test]
    fn test_memory_log_collects() {
        let log = MemoryTransactionLog::new();
        let mut md = TxnMetadata::new();
        md.insert("caller".into(), "admin".into());

        log.add_transaction(
            Transaction::new(TxnAction::DataDel, "obj", 10)
                .element(Some("content"))
                .actual_time(11)
                .metadata(md.clone()),
        )
        .unwrap();
        assert_eq!(log.len(), 1);

        let txns = log.drain();
        assert!(log.is_empty());
        assert_eq!(txns[0].element_id.as_deref(), Some("content"));
        assert_eq!(txns[0].timestamp, 10);
        assert_eq!(txns[0].actual_time, 11);
        assert_eq!(txns[0].metadata, md);
    }
}
