use async_trait::async_trait;
use sled::{Db, Tree};
use uuid::Uuid;

use crate::broker::message::UserId;
use crate::persistence::{AiLogEntry, AiLogStore};
use crate::utils::error::PersistenceError;

const AI_LOG_TREE: &str = "ai_logs";

/// AI log in a sled tree keyed by `mentee id | timestamp | uuid`, so one
/// mentee's entries are contiguous and in time order.
#[derive(Clone)]
pub struct SledAiLog {
    db: Db,
    tree: Tree,
}

impl SledAiLog {
    pub fn open(path: &str) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn from_db(db: Db) -> Result<Self, PersistenceError> {
        let tree = db.open_tree(AI_LOG_TREE)?;
        Ok(Self { db, tree })
    }

    fn key(entry: &AiLogEntry) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(&entry.mentee_id.to_be_bytes());
        key.extend_from_slice(&entry.timestamp.timestamp_millis().to_be_bytes());
        key.extend_from_slice(Uuid::new_v4().as_bytes());
        key
    }

    /// Every entry recorded for `mentee_id`, oldest first.
    pub fn entries_for(&self, mentee_id: UserId) -> Result<Vec<AiLogEntry>, PersistenceError> {
        self.tree
            .scan_prefix(mentee_id.to_be_bytes())
            .map(|res| -> Result<AiLogEntry, PersistenceError> {
                let (_, value) = res?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl AiLogStore for SledAiLog {
    async fn record(&self, entry: &AiLogEntry) -> Result<(), PersistenceError> {
        let serialized = serde_json::to_vec(entry)?;
        self.tree.insert(Self::key(entry), serialized)?;
        Ok(())
    }
}

impl std::fmt::Debug for SledAiLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledAiLog")
            .field("db", &"sled::Db")
            .field("entries", &self.tree.len())
            .finish()
    }
}
