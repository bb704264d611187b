//! Journal Controller
//!
//! Owns the data directory and the shared FD pool, and hands out
//! `Arc<Journal>` handles by id. Concurrent `get_or_create` calls for the
//! same id are coalesced: the map is double-checked under the write lock so
//! exactly one task opens the journal and everyone else shares the handle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use loghouse_core::{Error, JournalId, Result};

use crate::config::JournalConfig;
use crate::fdpool::FdPool;
use crate::journal::Journal;

/// Registry of open journals over one data directory and one FD pool.
pub struct JournalController {
    config: JournalConfig,
    pool: Arc<FdPool>,
    journals: RwLock<HashMap<JournalId, Arc<Journal>>>,
}

impl JournalController {
    pub fn new(config: JournalConfig) -> Self {
        let pool = Arc::new(FdPool::with_reader_buf_size(
            config.fd_pool_size,
            config.reader_buf_size,
        ));
        Self {
            config,
            pool,
            journals: RwLock::new(HashMap::new()),
        }
    }

    /// The shared reader pool backing every journal's reads.
    pub fn pool(&self) -> &Arc<FdPool> {
        &self.pool
    }

    /// Returns the journal for `id`, opening it on first use.
    pub async fn get_or_create(
        &self,
        ctx: &CancellationToken,
        id: &JournalId,
    ) -> Result<Arc<Journal>> {
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }

        // Fast path: already open.
        {
            let journals = self.journals.read().await;
            if let Some(journal) = journals.get(id) {
                return Ok(journal.clone());
            }
        }

        let mut journals = self.journals.write().await;
        // Double-check: another task may have opened it while we waited.
        if let Some(journal) = journals.get(id) {
            return Ok(journal.clone());
        }

        tracing::debug!(journal = %id, "opening journal");
        let dir = self.config.data_dir.join(id);
        let journal = Journal::open(
            id.clone(),
            dir,
            self.config.max_chunk_size,
            self.pool.clone(),
        )
        .await?;
        journals.insert(id.clone(), journal.clone());
        Ok(journal)
    }

    /// Closes every journal and the FD pool. Further acquisitions fail
    /// with `WrongState`.
    pub async fn close(&self) {
        let mut journals = self.journals.write().await;
        for journal in journals.values() {
            journal.close().await;
        }
        journals.clear();
        let _ = self.pool.close();
    }
}
