//! File-Descriptor Pool
//!
//! This module implements `FdPool`, which bounds the number of live OS file
//! handles across all journal readers and caches buffered readers for reuse.
//!
//! ## Why a Pool?
//!
//! Every cursor holds one reader per journal chunk it is positioned in.
//! With many concurrent queries over many journals, naive open-per-read
//! would exhaust the process fd limit. The pool:
//!
//! 1. **Bounds capacity**: a semaphore with `max_size` permits gates reader
//!    creation; saturated acquires block (FIFO) until a reader is closed,
//!    the pool is closed, or the caller cancels.
//! 2. **Caches readers**: released readers stay open, keyed by client id,
//!    so the next acquire for the same chunk reuses a warm handle.
//! 3. **Picks by locality**: among free readers the one whose buffered
//!    position is closest *behind* the requested offset wins, which keeps
//!    sequential scans on the same handle and minimizes seeks.
//!
//! ## Reader States
//!
//! ```text
//! Free ──acquire──▶ Busy ──release──▶ Free
//!   │                 │
//!   └──janitor──▶ Closed ◀── release_all_by_cid / close
//! ```
//!
//! At most one client holds a `Busy` reader at a time; the janitor only
//! ever closes `Free` readers. A release of a reader that is not `Busy`
//! (it raced an eviction or a double release) closes it physically.
//!
//! ## Locking
//!
//! One `std::sync::Mutex` protects the registration map and size counter.
//! It is held only for O(1) bookkeeping and never across an `.await`;
//! waiters suspend on the semaphore, not the mutex. Disk I/O happens on
//! the reader itself, outside the pool lock.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use loghouse_core::{Error, Result};

const STATE_FREE: u32 = 0;
const STATE_BUSY: u32 = 1;
const STATE_CLOSED: u32 = 3;

/// Buffered position is unknown (mid-seek, or interrupted read).
const POS_UNKNOWN: u64 = u64::MAX;

/// How often the janitor closes idle readers.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// A pooled buffered reader over one file.
///
/// The holder of a `Busy` reader has exclusive use; the async mutex around
/// the file is uncontended in that state and only arbitrates the close
/// paths.
pub struct FileReader {
    cid: u64,
    fname: PathBuf,
    state: AtomicU32,
    pos: AtomicU64,
    file: AsyncMutex<Option<BufReader<File>>>,
}

impl FileReader {
    async fn open(cid: u64, fname: PathBuf, buf_size: usize) -> Result<Self> {
        let file = File::open(&fname).await?;
        Ok(Self {
            cid,
            fname,
            state: AtomicU32::new(STATE_BUSY),
            pos: AtomicU64::new(0),
            file: AsyncMutex::new(Some(BufReader::with_capacity(buf_size, file))),
        })
    }

    /// The file this reader is bound to.
    pub fn file_name(&self) -> &std::path::Path {
        &self.fname
    }

    /// Current buffered position (next unread byte), if known.
    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    /// Unsigned forward distance from this reader's position to `offset`.
    ///
    /// Computed with wrapping subtraction on purpose: a reader already past
    /// the target wraps to a huge distance, which makes it as poor a
    /// candidate as one parked at the other end of the file.
    fn distance(&self, offset: u64) -> u64 {
        offset.wrapping_sub(self.pos.load(Ordering::Acquire))
    }

    fn is_free(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_FREE
    }

    fn make_busy(&self) -> bool {
        self.state
            .compare_exchange(STATE_FREE, STATE_BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn make_free(&self) -> bool {
        self.state
            .compare_exchange(STATE_BUSY, STATE_FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks the reader closed and drops the file handle if nobody is in
    /// the middle of an I/O call. A holder that raced us drops it on its
    /// next release instead.
    fn close(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        if let Ok(mut guard) = self.file.try_lock() {
            guard.take();
        }
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`, seeking only
    /// when the buffered position does not already match.
    pub async fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or(Error::WrongState("file reader is closed"))?;
        if self.pos.load(Ordering::Acquire) != offset {
            self.pos.store(POS_UNKNOWN, Ordering::Release);
            file.seek(SeekFrom::Start(offset)).await?;
        }
        // Invalidate across the read: if the future is dropped mid-read the
        // buffered position no longer matches the tracked one.
        self.pos.store(POS_UNKNOWN, Ordering::Release);
        file.read_exact(buf).await?;
        self.pos
            .store(offset + buf.len() as u64, Ordering::Release);
        Ok(())
    }
}

/// Readers cached for one client id (one chunk file).
struct ReaderGroup {
    fname: PathBuf,
    readers: Vec<Arc<FileReader>>,
}

impl ReaderGroup {
    fn new(fname: PathBuf) -> Self {
        Self {
            fname,
            readers: Vec::with_capacity(1),
        }
    }

    /// Picks the free reader closest behind `offset` and marks it busy.
    fn pick_free(&self, offset: u64) -> Option<Arc<FileReader>> {
        let mut best: Option<(usize, u64)> = None;
        for (i, fr) in self.readers.iter().enumerate() {
            if fr.is_free() {
                let d = fr.distance(offset);
                if best.map_or(true, |(_, bd)| d < bd) {
                    best = Some((i, d));
                }
            }
        }
        let (i, _) = best?;
        let fr = self.readers[i].clone();
        if fr.make_busy() {
            Some(fr)
        } else {
            None
        }
    }
}

struct PoolMap {
    groups: HashMap<u64, ReaderGroup>,
    /// Live (non-closed) readers plus in-flight creations.
    cur_size: usize,
}

struct PoolInner {
    max_size: usize,
    closed: AtomicBool,
    sem: Semaphore,
    map: Mutex<PoolMap>,
    reader_buf_size: usize,
}

impl PoolInner {
    /// Closes one reader and returns its capacity slot. No-op if it is
    /// already closed.
    fn close_reader_locked(&self, map: &mut PoolMap, fr: &Arc<FileReader>) {
        if fr.is_closed() {
            return;
        }
        fr.close();
        if let Some(group) = map.groups.get_mut(&fr.cid) {
            group.readers.retain(|r| !Arc::ptr_eq(r, fr));
        }
        map.cur_size -= 1;
        self.sem.add_permits(1);
    }

    /// Closes every free reader (or every reader when `all`), returning
    /// their permits. Groups are only removed when `all` is set.
    fn clean_locked(&self, map: &mut PoolMap, all: bool) {
        let mut closed = 0usize;
        for group in map.groups.values_mut() {
            group.readers.retain(|fr| {
                let evict = if all {
                    !fr.is_closed()
                } else {
                    // CAS guards against a concurrent acquire marking it busy.
                    fr.make_busy()
                };
                if evict {
                    fr.close();
                    closed += 1;
                    false
                } else {
                    !fr.is_closed()
                }
            });
        }
        if all {
            map.groups.clear();
        }
        map.cur_size -= closed;
        self.sem.add_permits(closed);
    }

    fn clean_free(&self) {
        let mut map = self.map.lock().expect("fd pool lock poisoned");
        self.clean_locked(&mut map, false);
    }
}

/// Bounded, cached pool of buffered file readers.
pub struct FdPool {
    inner: Arc<PoolInner>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl FdPool {
    /// Creates a pool with capacity for `max_size` simultaneously open
    /// readers. Panics on a zero capacity.
    pub fn new(max_size: usize) -> Self {
        Self::with_reader_buf_size(max_size, 64 * 1024)
    }

    /// Same as [`FdPool::new`] with an explicit read-buffer size.
    pub fn with_reader_buf_size(max_size: usize, reader_buf_size: usize) -> Self {
        assert!(max_size > 0, "fd pool capacity must be positive");

        let inner = Arc::new(PoolInner {
            max_size,
            closed: AtomicBool::new(false),
            sem: Semaphore::new(max_size),
            map: Mutex::new(PoolMap {
                groups: HashMap::new(),
                cur_size: 0,
            }),
            reader_buf_size,
        });

        // Janitor: periodically close idle readers so a burst of queries
        // does not pin fds forever. Holds only a weak reference so a
        // dropped pool stops the task.
        let weak = Arc::downgrade(&inner);
        let janitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                inner.clean_free();
            }
        });

        Self {
            inner,
            janitor: Mutex::new(Some(janitor)),
        }
    }

    /// Associates a client id with a file name. Re-registering an id is an
    /// error.
    pub fn register(&self, cid: u64, fname: impl Into<PathBuf>) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::WrongState("fd pool is closed"));
        }
        let mut map = self.inner.map.lock().expect("fd pool lock poisoned");
        if map.groups.contains_key(&cid) {
            return Err(Error::WrongState("client id is already registered"));
        }
        map.groups.insert(cid, ReaderGroup::new(fname.into()));
        Ok(())
    }

    /// Acquires a reader for `cid`, preferring one whose buffered position
    /// is closest behind `offset`. Blocks when the pool is saturated until
    /// a reader is released, the pool is closed (`WrongState`), or `ctx`
    /// fires (`Canceled`).
    pub async fn acquire(
        &self,
        ctx: &CancellationToken,
        cid: u64,
        offset: u64,
    ) -> Result<Arc<FileReader>> {
        let fname;
        {
            let mut map = self.inner.map.lock().expect("fd pool lock poisoned");
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(Error::WrongState("fd pool is closed"));
            }
            let group = map
                .groups
                .get(&cid)
                .ok_or(Error::WrongState("client id is not registered"))?;
            if let Some(fr) = group.pick_free(offset) {
                return Ok(fr);
            }
            fname = group.fname.clone();

            // Reserve a slot; when that takes us to the cap, push idle
            // readers out so the wait below can actually resolve.
            map.cur_size += 1;
            if map.cur_size >= self.inner.max_size {
                self.inner.clean_locked(&mut map, false);
            }
        }

        tokio::select! {
            _ = ctx.cancelled() => {
                self.unreserve();
                Err(Error::Canceled)
            }
            permit = self.inner.sem.acquire() => match permit {
                Err(_) => {
                    // Semaphore closed by pool close.
                    self.unreserve();
                    Err(Error::WrongState("fd pool is closed"))
                }
                Ok(permit) => {
                    permit.forget();
                    self.create_reader(cid, fname).await
                }
            },
        }
    }

    fn unreserve(&self) {
        let mut map = self.inner.map.lock().expect("fd pool lock poisoned");
        map.cur_size -= 1;
    }

    async fn create_reader(&self, cid: u64, fname: PathBuf) -> Result<Arc<FileReader>> {
        let fr = match FileReader::open(cid, fname, self.inner.reader_buf_size).await {
            Ok(fr) => Arc::new(fr),
            Err(e) => {
                self.unreserve();
                self.inner.sem.add_permits(1);
                return Err(e);
            }
        };

        let mut map = self.inner.map.lock().expect("fd pool lock poisoned");
        if self.inner.closed.load(Ordering::Acquire) {
            fr.close();
            map.cur_size -= 1;
            return Err(Error::WrongState("fd pool is closed"));
        }
        match map.groups.get_mut(&cid) {
            Some(group) => {
                group.readers.push(fr.clone());
                Ok(fr)
            }
            None => {
                // The group was released while we were opening the file.
                fr.close();
                map.cur_size -= 1;
                self.inner.sem.add_permits(1);
                Err(Error::WrongState("client id is not registered"))
            }
        }
    }

    /// Returns a busy reader to the free list. A reader that is not busy
    /// (double release, or it raced a close) is closed physically instead.
    pub fn release(&self, fr: Arc<FileReader>) {
        if fr.make_free() {
            let mut map = self.inner.map.lock().expect("fd pool lock poisoned");
            if map.cur_size >= self.inner.max_size {
                self.inner.clean_locked(&mut map, false);
            }
            return;
        }

        let mut map = self.inner.map.lock().expect("fd pool lock poisoned");
        self.inner.close_reader_locked(&mut map, &fr);
    }

    /// Closes every reader registered under `cid` and removes the group.
    pub fn release_all_by_cid(&self, cid: u64) {
        let mut map = self.inner.map.lock().expect("fd pool lock poisoned");
        if let Some(group) = map.groups.remove(&cid) {
            let mut closed = 0usize;
            for fr in &group.readers {
                if !fr.is_closed() {
                    fr.close();
                    closed += 1;
                }
            }
            map.cur_size -= closed;
            self.inner.sem.add_permits(closed);
            tracing::debug!(cid, readers = closed, "released reader group");
        }
    }

    /// Closes the pool: every reader is closed, blocked acquirers observe
    /// `WrongState`, and further calls are refused.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::WrongState("fd pool is closed"));
        }
        {
            let mut map = self.inner.map.lock().expect("fd pool lock poisoned");
            self.inner.clean_locked(&mut map, true);
        }
        self.inner.sem.close();
        if let Some(handle) = self.janitor.lock().expect("janitor lock poisoned").take() {
            handle.abort();
        }
        tracing::debug!("fd pool closed");
        Ok(())
    }

    /// Live (non-closed) readers plus in-flight creations. May transiently
    /// exceed `max_size` while acquirers wait on the semaphore; the count of
    /// actually open readers never does.
    pub fn cur_size(&self) -> usize {
        self.inner.map.lock().expect("fd pool lock poisoned").cur_size
    }

    /// Number of open (non-closed) readers across all groups.
    pub fn live_readers(&self) -> usize {
        let map = self.inner.map.lock().expect("fd pool lock poisoned");
        map.groups
            .values()
            .map(|g| g.readers.iter().filter(|fr| !fr.is_closed()).count())
            .sum()
    }

    /// Maximum simultaneously open readers.
    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }
}

impl Drop for FdPool {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
