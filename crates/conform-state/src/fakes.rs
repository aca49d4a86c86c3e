//! In-memory fakes for the ledger trait (testing only)

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::LedgerResult;
use crate::ledger::{LedgerEntry, RunLedger};

/// In-memory run ledger backed by a `Vec<LedgerEntry>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger pre-seeded with history.
    pub fn with_entries(entries: Vec<LedgerEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn append(&self, entry: LedgerEntry) -> LedgerResult<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }

    async fn entries(&self) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self.entries.lock().await.clone())
    }
}
