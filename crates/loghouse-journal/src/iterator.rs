//! Journal Iterator
//!
//! Forward-only, repositionable iterator over one journal's records.
//!
//! `get` peeks the current record without advancing and caches it; `next`
//! advances one record. A `get` that runs past the last record reports
//! end-of-data and leaves the iterator parked at the first unwritten slot,
//! so the same call picks up new records once a writer appends them - EOF
//! is never cached.
//!
//! The iterator borrows one buffered reader from the journal's [`FdPool`]
//! at a time; crossing a chunk boundary swaps it for the next chunk's
//! reader. [`release`](JournalIterator::release) hands the reader back
//! without losing the logical position, which is how idle cursors avoid
//! pinning file handles.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use loghouse_core::{Error, JournalPos, LogEvent, Result};

use crate::chunk::{self, FRAME_HEADER, MAX_FRAME};
use crate::fdpool::FileReader;
use crate::journal::{Journal, Locate};

/// Forward cursor over a single journal.
pub struct JournalIterator {
    journal: Arc<Journal>,
    pos: JournalPos,
    cur: Option<LogEvent>,
    reader: Option<Arc<FileReader>>,
    reader_cid: u64,
}

impl JournalIterator {
    pub(crate) fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            pos: JournalPos::HEAD,
            cur: None,
            reader: None,
            reader_cid: 0,
        }
    }

    /// The journal this iterator reads.
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Returns the current record without advancing. After an `Eof` the
    /// position points at the next-to-be-written slot.
    pub async fn get(&mut self, ctx: &CancellationToken) -> Result<LogEvent> {
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }
        if let Some(ev) = &self.cur {
            return Ok(ev.clone());
        }

        let (pool_cid, offset, pos) = match self.journal.locate(self.pos).await {
            Locate::Frame {
                pool_cid,
                offset,
                pos,
            } => (pool_cid, offset, pos),
            Locate::Eof { pos } => {
                self.pos = pos;
                return Err(Error::Eof);
            }
        };
        self.pos = pos;

        let reader = self.reader_for(ctx, pool_cid, offset).await?;
        let ev = tokio::select! {
            _ = ctx.cancelled() => return Err(Error::Canceled),
            res = Self::read_frame(&reader, offset) => res?,
        };
        self.cur = Some(ev.clone());
        Ok(ev)
    }

    /// Advances one record. The advance is lazy: when no record is cached
    /// it performs a `get` first, and a failure there is deferred to the
    /// caller's next `get`.
    pub async fn next(&mut self, ctx: &CancellationToken) {
        if self.cur.is_none() && self.get(ctx).await.is_err() {
            return;
        }
        if self.cur.take().is_some() {
            self.pos = self.pos.next_idx();
        }
    }

    /// Current position. After an EOF `get` this is the first unwritten
    /// slot.
    pub fn pos(&self) -> JournalPos {
        self.pos
    }

    /// Seeks to a logical position. `JournalPos::TAIL` means just past the
    /// last record, `JournalPos::HEAD` the first one. Purely logical - no
    /// I/O happens until the next `get`.
    pub fn set_pos(&mut self, pos: JournalPos) {
        self.cur = None;
        self.pos = pos;
    }

    /// Returns the pooled reader without touching the logical position.
    pub fn release(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.journal.pool().release(reader);
        }
    }

    async fn reader_for(
        &mut self,
        ctx: &CancellationToken,
        pool_cid: u64,
        offset: u64,
    ) -> Result<Arc<FileReader>> {
        if let Some(reader) = &self.reader {
            if self.reader_cid == pool_cid {
                return Ok(reader.clone());
            }
            // Crossed into another chunk.
            self.release();
        }
        let reader = self.journal.pool().acquire(ctx, pool_cid, offset).await?;
        self.reader_cid = pool_cid;
        self.reader = Some(reader.clone());
        Ok(reader)
    }

    async fn read_frame(reader: &Arc<FileReader>, offset: u64) -> Result<LogEvent> {
        let mut header = [0u8; FRAME_HEADER];
        reader.read_exact_at(offset, &mut header).await?;
        let len = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if len > MAX_FRAME {
            return Err(Error::Corrupt(format!(
                "frame length {} in {}",
                len,
                reader.file_name().display()
            )));
        }
        let mut payload = vec![0u8; len as usize];
        reader
            .read_exact_at(offset + FRAME_HEADER as u64, &mut payload)
            .await?;
        chunk::check_frame(crc, &payload, reader.file_name())?;
        chunk::decode_event(&payload)
    }
}

impl Drop for JournalIterator {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdpool::FdPool;

    fn event(ts: i64, msg: &str) -> LogEvent {
        LogEvent::new(ts, msg.to_string())
    }

    async fn journal_with(
        dir: &std::path::Path,
        max_chunk: u64,
        events: &[LogEvent],
    ) -> (Arc<Journal>, Arc<FdPool>) {
        let pool = Arc::new(FdPool::new(8));
        let journal = Journal::open(
            "itertest".to_string(),
            dir.join("itertest"),
            max_chunk,
            pool.clone(),
        )
        .await
        .unwrap();
        journal.append(events).await.unwrap();
        (journal, pool)
    }

    #[tokio::test]
    async fn test_get_peeks_without_advancing() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _pool) =
            journal_with(dir.path(), 1 << 20, &[event(1, "a"), event(2, "b")]).await;
        let ctx = CancellationToken::new();
        let mut it = journal.iterator();

        let first = it.get(&ctx).await.unwrap();
        let again = it.get(&ctx).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(it.pos(), JournalPos::new(0, 0));
    }

    #[tokio::test]
    async fn test_get_next_walks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let events = vec![event(1, "a"), event(2, "b"), event(3, "c")];
        let (journal, _pool) = journal_with(dir.path(), 1 << 20, &events).await;
        let ctx = CancellationToken::new();
        let mut it = journal.iterator();

        for expected in &events {
            let got = it.get(&ctx).await.unwrap();
            assert_eq!(&got, expected);
            it.next(&ctx).await;
        }
        assert!(it.get(&ctx).await.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn test_walks_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let events = vec![event(1, "a"), event(2, "b"), event(3, "c")];
        // One record per chunk.
        let (journal, _pool) = journal_with(dir.path(), 1, &events).await;
        let ctx = CancellationToken::new();
        let mut it = journal.iterator();

        let mut seen = Vec::new();
        loop {
            match it.get(&ctx).await {
                Ok(ev) => {
                    seen.push(ev);
                    it.next(&ctx).await;
                }
                Err(e) if e.is_eof() => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(seen, events);
    }

    #[tokio::test]
    async fn test_eof_then_new_data() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _pool) = journal_with(dir.path(), 1 << 20, &[event(1, "a")]).await;
        let ctx = CancellationToken::new();
        let mut it = journal.iterator();

        it.get(&ctx).await.unwrap();
        it.next(&ctx).await;
        assert!(it.get(&ctx).await.unwrap_err().is_eof());
        let parked = it.pos();

        journal.append(&[event(2, "late")]).await.unwrap();
        let ev = it.get(&ctx).await.unwrap();
        assert_eq!(ev.msg, bytes::Bytes::from("late"));
        assert_eq!(it.pos(), parked);
    }

    #[tokio::test]
    async fn test_set_pos_tail_and_head() {
        let dir = tempfile::tempdir().unwrap();
        let events = vec![event(1, "a"), event(2, "b")];
        let (journal, _pool) = journal_with(dir.path(), 1 << 20, &events).await;
        let ctx = CancellationToken::new();
        let mut it = journal.iterator();

        it.set_pos(JournalPos::TAIL);
        assert!(it.get(&ctx).await.unwrap_err().is_eof());
        // EOF normalized the sentinel to the concrete tail.
        assert_eq!(it.pos(), JournalPos::new(0, 2));

        it.set_pos(JournalPos::HEAD);
        assert_eq!(it.get(&ctx).await.unwrap(), events[0]);
    }

    #[tokio::test]
    async fn test_next_before_get_is_lazy() {
        let dir = tempfile::tempdir().unwrap();
        let events = vec![event(1, "a"), event(2, "b")];
        let (journal, _pool) = journal_with(dir.path(), 1 << 20, &events).await;
        let ctx = CancellationToken::new();
        let mut it = journal.iterator();

        // next without a prior get resolves the record itself, then skips it.
        it.next(&ctx).await;
        assert_eq!(it.get(&ctx).await.unwrap(), events[1]);
    }

    #[tokio::test]
    async fn test_cancellation_leaves_position() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _pool) = journal_with(dir.path(), 1 << 20, &[event(1, "a")]).await;
        let mut it = journal.iterator();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(it.get(&cancelled).await.unwrap_err().is_canceled());
        assert_eq!(it.pos(), JournalPos::HEAD);

        // A non-cancelled retry returns the record cancellation skipped.
        let ctx = CancellationToken::new();
        assert_eq!(it.get(&ctx).await.unwrap().msg, bytes::Bytes::from("a"));
    }

    #[tokio::test]
    async fn test_release_keeps_logical_position() {
        let dir = tempfile::tempdir().unwrap();
        let events = vec![event(1, "a"), event(2, "b")];
        let (journal, pool) = journal_with(dir.path(), 1 << 20, &events).await;
        let ctx = CancellationToken::new();
        let mut it = journal.iterator();

        it.get(&ctx).await.unwrap();
        it.next(&ctx).await;
        it.release();
        assert_eq!(pool.cur_size(), 1); // cached in the pool, not held

        assert_eq!(it.get(&ctx).await.unwrap(), events[1]);
    }

    #[tokio::test]
    async fn test_drop_returns_reader() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, pool) = journal_with(dir.path(), 1 << 20, &[event(1, "a")]).await;
        let ctx = CancellationToken::new();
        {
            let mut it = journal.iterator();
            it.get(&ctx).await.unwrap();
        }
        // The reader went back to the pool's free list on drop.
        let it2 = journal.iterator();
        drop(it2);
        assert!(pool.live_readers() <= 1);
    }
}
