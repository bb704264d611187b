//! Journal - One Tag Line's Append-Only Record Stream
//!
//! A `Journal` owns one on-disk directory of chunk files and the in-memory
//! chunk table that maps `(chunk id, record index)` positions to byte
//! offsets. Appends go to the active (last) chunk and roll to a fresh chunk
//! when it fills; reads go through the shared [`FdPool`] via
//! [`JournalIterator`](crate::JournalIterator).
//!
//! ## Data-Available Signal
//!
//! The journal publishes its total record count on a `watch` channel after
//! every append. Cursors parked at the tail subscribe to it instead of
//! polling, which is what makes wait-for-data queries cheap.
//!
//! ## Recovery
//!
//! Opening an existing journal scans every chunk to rebuild frame indexes.
//! A torn append at the tail of the active chunk is truncated away; torn
//! bytes in a sealed chunk are logged and ignored (they are unreachable -
//! the index simply ends before them).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, RwLock};

use loghouse_core::{JournalId, JournalPos, LogEvent, Result};

use crate::chunk::{self, ChunkMeta, FRAME_HEADER};
use crate::fdpool::FdPool;
use crate::iterator::JournalIterator;

/// Where a position lands in the journal.
#[derive(Debug)]
pub(crate) enum Locate {
    /// A readable record: its pool client id, byte offset, and the
    /// normalized position.
    Frame {
        pool_cid: u64,
        offset: u64,
        pos: JournalPos,
    },
    /// Past the last record; `pos` is the first unwritten slot.
    Eof { pos: JournalPos },
}

struct ChunkWriter {
    chunk_id: u64,
    file: File,
}

struct JournalInner {
    chunks: BTreeMap<u64, ChunkMeta>,
    writer: Option<ChunkWriter>,
    total: u64,
}

impl JournalInner {
    fn tail(&self) -> JournalPos {
        match self.chunks.iter().next_back() {
            Some((&id, meta)) => JournalPos::new(id, meta.record_count()),
            None => JournalPos::HEAD,
        }
    }

    fn head(&self) -> JournalPos {
        match self.chunks.keys().next() {
            Some(&id) => JournalPos::new(id, 0),
            None => JournalPos::HEAD,
        }
    }
}

/// One tag line's append-only record stream, stored as chunk files.
pub struct Journal {
    id: JournalId,
    dir: PathBuf,
    max_chunk_size: u64,
    pool: Arc<FdPool>,
    inner: RwLock<JournalInner>,
    data_tx: watch::Sender<u64>,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .finish()
    }
}

impl Journal {
    /// Opens (or creates) the journal directory, scanning existing chunks
    /// and registering their files with the reader pool.
    pub async fn open(
        id: JournalId,
        dir: PathBuf,
        max_chunk_size: u64,
        pool: Arc<FdPool>,
    ) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&dir).await?;

        let mut ids = Vec::new();
        let mut rd = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(cid) = chunk::parse_chunk_file_name(name) {
                    ids.push(cid);
                }
            }
        }
        ids.sort_unstable();

        let mut chunks = BTreeMap::new();
        let mut total = 0u64;
        for (i, cid) in ids.iter().enumerate() {
            let path = dir.join(chunk::chunk_file_name(*cid));
            let (mut meta, torn) = ChunkMeta::open(*cid, path).await?;
            let last = i + 1 == ids.len();
            if torn > 0 {
                if last {
                    tracing::warn!(
                        journal = %id,
                        chunk = *cid,
                        torn_bytes = torn,
                        "truncating torn tail of active chunk"
                    );
                    let file = OpenOptions::new().write(true).open(&meta.path).await?;
                    file.set_len(meta.size).await?;
                } else {
                    tracing::warn!(
                        journal = %id,
                        chunk = *cid,
                        torn_bytes = torn,
                        "ignoring unreachable bytes in sealed chunk"
                    );
                }
            }
            meta.sealed = !last;
            total += meta.record_count() as u64;
            pool.register(meta.pool_cid, &meta.path)?;
            chunks.insert(*cid, meta);
        }

        tracing::debug!(journal = %id, chunks = chunks.len(), records = total, "opened journal");

        let (data_tx, _) = watch::channel(total);
        Ok(Arc::new(Self {
            id,
            dir,
            max_chunk_size,
            pool,
            inner: RwLock::new(JournalInner {
                chunks,
                writer: None,
                total,
            }),
            data_tx,
        }))
    }

    pub fn id(&self) -> &JournalId {
        &self.id
    }

    pub(crate) fn pool(&self) -> &Arc<FdPool> {
        &self.pool
    }

    /// Subscribes to the data-available signal. The channel carries the
    /// total record count; any change means new data.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.data_tx.subscribe()
    }

    /// Position just past the last record.
    pub async fn tail_pos(&self) -> JournalPos {
        self.inner.read().await.tail()
    }

    /// Position of the first record.
    pub async fn head_pos(&self) -> JournalPos {
        self.inner.read().await.head()
    }

    /// Total records currently in the journal.
    pub async fn record_count(&self) -> u64 {
        self.inner.read().await.total
    }

    /// Creates a forward iterator positioned at the head.
    pub fn iterator(self: &Arc<Self>) -> JournalIterator {
        JournalIterator::new(self.clone())
    }

    /// Appends events in order, rolling chunks as they fill, then fires the
    /// data-available signal. Returns the new tail position.
    pub async fn append(&self, events: &[LogEvent]) -> Result<JournalPos> {
        let mut inner = self.inner.write().await;
        if events.is_empty() {
            return Ok(inner.tail());
        }

        let mut payload = BytesMut::new();
        let mut frame = BytesMut::new();
        for ev in events {
            self.ensure_writer(&mut inner).await?;

            payload.clear();
            chunk::encode_event(ev, &mut payload);
            frame.clear();
            frame.reserve(payload.len() + FRAME_HEADER);
            chunk::frame_payload(&payload, &mut frame);

            let chunk_id = {
                let w = inner.writer.as_mut().expect("writer just ensured");
                w.file.write_all(&frame).await?;
                w.chunk_id
            };
            let meta = inner
                .chunks
                .get_mut(&chunk_id)
                .expect("active chunk present");
            meta.push_frame(frame.len() as u64);
            let chunk_full = meta.size >= self.max_chunk_size;
            inner.total += 1;

            if chunk_full {
                self.seal_active(&mut inner);
            }
        }

        if let Some(w) = inner.writer.as_mut() {
            w.file.flush().await?;
        }
        let tail = inner.tail();
        let total = inner.total;
        drop(inner);

        // Signal after the index is updated so a woken reader sees the data.
        let _ = self.data_tx.send(total);
        Ok(tail)
    }

    /// Deletes sealed chunks with id strictly below `chunk_id` and releases
    /// their pool registrations. The active chunk is never deleted.
    /// Returns the number of chunks dropped.
    pub async fn drop_chunks_before(&self, chunk_id: u64) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let victims: Vec<u64> = inner
            .chunks
            .iter()
            .filter(|(&id, meta)| id < chunk_id && meta.sealed)
            .map(|(&id, _)| id)
            .collect();

        for id in &victims {
            let meta = inner.chunks.remove(id).expect("victim present");
            self.pool.release_all_by_cid(meta.pool_cid);
            inner.total -= meta.record_count() as u64;
            tokio::fs::remove_file(&meta.path).await?;
            tracing::debug!(journal = %self.id, chunk = *id, "dropped chunk");
        }
        Ok(victims.len())
    }

    /// Closes the journal: drops the append handle and releases every
    /// chunk's pooled readers.
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;
        inner.writer = None;
        for meta in inner.chunks.values() {
            self.pool.release_all_by_cid(meta.pool_cid);
        }
        tracing::debug!(journal = %self.id, "closed journal");
    }

    /// Resolves a position to a readable frame or the normalized EOF slot.
    pub(crate) async fn locate(&self, pos: JournalPos) -> Locate {
        let inner = self.inner.read().await;
        if pos.is_tail_sentinel() {
            return Locate::Eof { pos: inner.tail() };
        }

        let mut pos = pos;
        loop {
            let Some((&cid, meta)) = inner.chunks.range(pos.chunk_id..).next() else {
                return Locate::Eof { pos: inner.tail() };
            };
            // A position in a dropped or skipped chunk moves forward to the
            // next chunk's first record.
            let idx = if cid == pos.chunk_id { pos.idx } else { 0 };
            pos = JournalPos::new(cid, idx);

            if let Some(offset) = meta.offset_of(idx) {
                return Locate::Frame {
                    pool_cid: meta.pool_cid,
                    offset,
                    pos,
                };
            }
            if meta.sealed {
                pos = JournalPos::new(cid + 1, 0);
                continue;
            }
            return Locate::Eof { pos: inner.tail() };
        }
    }

    async fn ensure_writer(&self, inner: &mut JournalInner) -> Result<()> {
        if inner.writer.is_some() {
            return Ok(());
        }
        let active = match inner.chunks.iter().next_back() {
            Some((&id, meta)) if !meta.sealed => Some((id, meta.path.clone())),
            Some((&id, _)) => {
                return self.roll_chunk(inner, id + 1).await;
            }
            None => None,
        };
        match active {
            Some((id, path)) => {
                let file = OpenOptions::new().append(true).open(&path).await?;
                inner.writer = Some(ChunkWriter { chunk_id: id, file });
                Ok(())
            }
            None => self.roll_chunk(inner, 0).await,
        }
    }

    async fn roll_chunk(&self, inner: &mut JournalInner, chunk_id: u64) -> Result<()> {
        let path = self.dir.join(chunk::chunk_file_name(chunk_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let meta = ChunkMeta::new(chunk_id, path);
        self.pool.register(meta.pool_cid, &meta.path)?;
        tracing::debug!(journal = %self.id, chunk = chunk_id, "rolled new chunk");
        inner.chunks.insert(chunk_id, meta);
        inner.writer = Some(ChunkWriter { chunk_id, file });
        Ok(())
    }

    fn seal_active(&self, inner: &mut JournalInner) {
        if let Some(w) = inner.writer.take() {
            if let Some(meta) = inner.chunks.get_mut(&w.chunk_id) {
                meta.sealed = true;
                tracing::debug!(
                    journal = %self.id,
                    chunk = w.chunk_id,
                    records = meta.record_count(),
                    "sealed chunk"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: i64, msg: &str) -> LogEvent {
        LogEvent::new(ts, msg.to_string())
    }

    async fn open_journal(dir: &std::path::Path, max_chunk: u64) -> (Arc<Journal>, Arc<FdPool>) {
        let pool = Arc::new(FdPool::new(16));
        let journal = Journal::open(
            "testjournal".to_string(),
            dir.join("testjournal"),
            max_chunk,
            pool.clone(),
        )
        .await
        .unwrap();
        (journal, pool)
    }

    #[tokio::test]
    async fn test_open_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _pool) = open_journal(dir.path(), 1024).await;
        assert_eq!(journal.record_count().await, 0);
        assert_eq!(journal.tail_pos().await, JournalPos::HEAD);
    }

    #[tokio::test]
    async fn test_append_advances_tail() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _pool) = open_journal(dir.path(), 1024 * 1024).await;

        let tail = journal.append(&[event(1, "a"), event(2, "b")]).await.unwrap();
        assert_eq!(tail, JournalPos::new(0, 2));
        assert_eq!(journal.record_count().await, 2);
    }

    #[tokio::test]
    async fn test_append_rolls_chunks() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny chunks: every record rolls.
        let (journal, _pool) = open_journal(dir.path(), 1).await;

        journal.append(&[event(1, "a")]).await.unwrap();
        journal.append(&[event(2, "b")]).await.unwrap();
        journal.append(&[event(3, "c")]).await.unwrap();

        let tail = journal.tail_pos().await;
        assert_eq!(tail.chunk_id, 2);
        assert_eq!(journal.record_count().await, 3);
    }

    #[tokio::test]
    async fn test_locate_walks_chunk_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _pool) = open_journal(dir.path(), 1).await;
        journal.append(&[event(1, "a"), event(2, "b")]).await.unwrap();

        // Chunk 0 holds one record; position (0, 1) resolves into chunk 1.
        match journal.locate(JournalPos::new(0, 1)).await {
            Locate::Frame { pos, .. } => assert_eq!(pos, JournalPos::new(1, 0)),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_locate_past_tail_is_eof() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _pool) = open_journal(dir.path(), 1024 * 1024).await;
        journal.append(&[event(1, "a")]).await.unwrap();

        match journal.locate(JournalPos::new(0, 5)).await {
            Locate::Eof { pos } => assert_eq!(pos, JournalPos::new(0, 1)),
            other => panic!("expected eof, got {:?}", other),
        }
        match journal.locate(JournalPos::TAIL).await {
            Locate::Eof { pos } => assert_eq!(pos, JournalPos::new(0, 1)),
            other => panic!("expected eof, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (journal, pool) = open_journal(dir.path(), 64).await;
            journal
                .append(&[event(1, "one"), event(2, "two"), event(3, "three")])
                .await
                .unwrap();
            journal.close().await;
            pool.close().unwrap();
        }

        let (journal, _pool) = open_journal(dir.path(), 64).await;
        assert_eq!(journal.record_count().await, 3);
        let tail = journal.tail_pos().await;
        match journal.locate(JournalPos::HEAD).await {
            Locate::Frame { pos, .. } => assert_eq!(pos, JournalPos::HEAD),
            other => panic!("expected frame, got {:?}", other),
        }
        match journal.locate(tail).await {
            Locate::Eof { pos } => assert_eq!(pos, tail),
            other => panic!("expected eof, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_watch_fires_on_append() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _pool) = open_journal(dir.path(), 1024 * 1024).await;
        let mut rx = journal.subscribe();
        rx.borrow_and_update();

        journal.append(&[event(1, "x")]).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn test_drop_chunks_before() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _pool) = open_journal(dir.path(), 1).await;
        journal.append(&[event(1, "a")]).await.unwrap();
        journal.append(&[event(2, "b")]).await.unwrap();
        journal.append(&[event(3, "c")]).await.unwrap();

        let dropped = journal.drop_chunks_before(2).await.unwrap();
        assert_eq!(dropped, 2);
        assert_eq!(journal.record_count().await, 1);

        // The head now lives in chunk 2; earlier positions resolve forward.
        match journal.locate(JournalPos::HEAD).await {
            Locate::Frame { pos, .. } => assert_eq!(pos, JournalPos::new(2, 0)),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drop_never_touches_active_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _pool) = open_journal(dir.path(), 1024 * 1024).await;
        journal.append(&[event(1, "a")]).await.unwrap();

        let dropped = journal.drop_chunks_before(u64::MAX).await.unwrap();
        assert_eq!(dropped, 0);
        assert_eq!(journal.record_count().await, 1);
    }
}
