//! Cursor - One Query Session
//!
//! A `Cursor` owns everything one query needs: the resolved source
//! journals, their iterators merged into a single time-ordered stream, the
//! `where` filter, and the opaque resume position.
//!
//! ## Position String
//!
//! The corner values `""`/`"head"`/`"tail"` (case-insensitive) seek every
//! source to the endpoints. Otherwise the position is a per-journal map:
//!
//! ```text
//! <journal-id>=<chunk-hex>.<idx-hex>[:<journal-id>=<pos>...]
//! ```
//!
//! Unknown journal ids in an incoming position are ignored (the client may
//! have picked up a new source since); sources missing from the map stay
//! at the head. Clients treat the whole string as an opaque blob.
//!
//! ## Commit
//!
//! `commit` performs one `get` first so a pending lazy advance is
//! resolved, then captures each iterator's position and releases its
//! pooled reader. An idle (committed) cursor therefore holds no file
//! handles, and resuming from the returned state continues at exactly the
//! record after the last one delivered.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use loghouse_core::{Error, JournalId, JournalPos, Result, TagLine};
use loghouse_journal::{JournalController, JournalIterator};

use crate::lql::{self, WhereExpr};
use crate::mixer::{build_merge, earliest, EventSource, TaggedEvent};
use crate::tindex::TagIndex;

/// Hard ceiling on wait-for-data blocking.
pub const MAX_WAIT: Duration = Duration::from_secs(60);

/// Serializable description of a cursor: enough to recreate it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    /// Session id, assigned by the server.
    pub id: u64,

    /// Tag expression selecting the source journals.
    pub sources: String,

    /// Record filter. Empty means all records.
    #[serde(rename = "where")]
    pub where_: String,

    /// Position of the record to be read next.
    pub pos: String,
}

impl fmt::Display for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id: {}, sources: \"{}\", where: \"{}\", pos: {}}}",
            self.id, self.sources, self.where_, self.pos
        )
    }
}

#[derive(Debug, Clone)]
pub struct CursorConfig {
    /// Maximum journals one cursor may fan out over (default: 50).
    pub max_sources: usize,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self { max_sources: 50 }
    }
}

struct SourceDesc {
    journal_id: JournalId,
    data_rx: watch::Receiver<u64>,
    it: Arc<AsyncMutex<JournalIterator>>,
}

/// Adapts one journal iterator into a tagged event source for the merge.
struct JournalSource {
    tag: TagLine,
    it: Arc<AsyncMutex<JournalIterator>>,
}

#[async_trait]
impl EventSource for JournalSource {
    async fn get(&mut self, ctx: &CancellationToken) -> Result<TaggedEvent> {
        let mut it = self.it.lock().await;
        let event = it.get(ctx).await?;
        Ok(TaggedEvent {
            event,
            tag: self.tag.clone(),
        })
    }

    async fn next(&mut self, ctx: &CancellationToken) {
        self.it.lock().await.next(ctx).await;
    }
}

/// One query session over a merged set of journals.
pub struct Cursor {
    state: CursorState,
    filter: WhereExpr,
    merged: Box<dyn EventSource>,
    descs: Vec<SourceDesc>,
    closed: bool,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("state", &self.state)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Cursor {
    /// Resolves the state's sources through the tag index and builds the
    /// merged iterator, then applies the state's position.
    ///
    /// Fails with `NoSources` when the expression matches nothing and
    /// `TooManySources` past the configured cap; in both cases nothing
    /// stays acquired.
    pub async fn open(
        ctx: &CancellationToken,
        state: CursorState,
        tindex: &Arc<dyn TagIndex>,
        ctrl: &Arc<JournalController>,
        config: &CursorConfig,
    ) -> Result<Cursor> {
        let expr = lql::parse_source_expr(&state.sources)?;
        let filter = lql::parse_where(&state.where_)?;

        let srcs = tindex.get_journals(&expr, config.max_sources + 1).await?;
        if srcs.is_empty() {
            return Err(Error::NoSources(state.sources.clone()));
        }
        if srcs.len() > config.max_sources {
            return Err(Error::TooManySources {
                found: srcs.len(),
                limit: config.max_sources,
            });
        }

        let mut descs = Vec::with_capacity(srcs.len());
        let mut sources: Vec<Box<dyn EventSource>> = Vec::with_capacity(srcs.len());
        for (tag, journal_id) in srcs {
            let journal = ctrl.get_or_create(ctx, &journal_id).await?;
            let it = Arc::new(AsyncMutex::new(journal.iterator()));
            sources.push(Box::new(JournalSource {
                tag,
                it: it.clone(),
            }));
            descs.push(SourceDesc {
                journal_id,
                data_rx: journal.subscribe(),
                it,
            });
        }

        let merged = build_merge(sources, earliest);
        let mut cursor = Cursor {
            state,
            filter,
            merged,
            descs,
            closed: false,
        };
        cursor.apply_pos().await?;
        tracing::debug!(cursor = %cursor.state, "opened cursor");
        Ok(cursor)
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn state(&self) -> &CursorState {
        &self.state
    }

    /// Returns the next record matching the filter. Non-matching records
    /// are skipped silently; `Eof` means every source is exhausted.
    pub async fn get(&mut self, ctx: &CancellationToken) -> Result<TaggedEvent> {
        if self.closed {
            return Err(Error::WrongState("cursor is closed"));
        }
        loop {
            if ctx.is_cancelled() {
                return Err(Error::Canceled);
            }
            let te = self.merged.get(ctx).await?;
            if self.filter.matches(&te.event) {
                return Ok(te);
            }
            self.merged.next(ctx).await;
        }
    }

    /// Advances the merged stream by one record.
    pub async fn next(&mut self, ctx: &CancellationToken) {
        if !self.closed {
            self.merged.next(ctx).await;
        }
    }

    /// Applies a new state to this cursor. Only the position may change;
    /// a state for a different id, sources, or filter is refused. On
    /// failure the previous position remains in effect on every iterator.
    pub async fn apply_state(&mut self, state: CursorState) -> Result<()> {
        if self.closed {
            return Err(Error::WrongState("cursor is closed"));
        }
        if state.id != self.state.id
            || state.sources != self.state.sources
            || state.where_ != self.state.where_
        {
            return Err(Error::WrongState("state belongs to a different query"));
        }
        if state.pos != self.state.pos {
            let old = std::mem::replace(&mut self.state.pos, state.pos);
            if let Err(e) = self.apply_pos().await {
                self.state.pos = old;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Captures the current per-journal positions into the opaque position
    /// string, releases every pooled reader, and returns the new state.
    pub async fn commit(&mut self, ctx: &CancellationToken) -> Result<CursorState> {
        if self.closed {
            return Err(Error::WrongState("cursor is closed"));
        }
        // One get resolves any pending lazy advance and normalizes EOF
        // positions, so the committed position is exactly "record after the
        // last one delivered".
        match self.merged.get(ctx).await {
            Err(e) if e.is_canceled() => return Err(Error::Canceled),
            _ => {}
        }

        let mut parts = Vec::with_capacity(self.descs.len());
        for desc in &self.descs {
            let mut it = desc.it.lock().await;
            parts.push(format!("{}={}", desc.journal_id, it.pos()));
            it.release();
        }
        self.state.pos = parts.join(":");
        Ok(self.state.clone())
    }

    /// Releases every iterator; the cursor becomes unusable.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        for desc in &self.descs {
            desc.it.lock().await.release();
        }
        self.closed = true;
        tracing::debug!(cursor_id = self.state.id, "closed cursor");
    }

    /// Blocks until any source journal reports new data, the timeout
    /// expires (`Eof`), or `ctx` fires (`Canceled`). The timeout is
    /// clamped to [`MAX_WAIT`].
    pub async fn wait_for_data(
        &mut self,
        ctx: &CancellationToken,
        timeout: Duration,
    ) -> Result<()> {
        let timeout = timeout.min(MAX_WAIT);

        // A signal that fired since the last wait means data may already be
        // there - acknowledge it and let the caller re-read instead of
        // sleeping through it.
        for desc in &mut self.descs {
            if desc.data_rx.has_changed().unwrap_or(false) {
                desc.data_rx.borrow_and_update();
                return Ok(());
            }
        }

        let changed = futures::future::select_all(
            self.descs
                .iter_mut()
                .map(|d| Box::pin(d.data_rx.changed())),
        );
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Canceled),
            res = tokio::time::timeout(timeout, changed) => match res {
                Err(_elapsed) => Err(Error::Eof),
                Ok((Ok(()), _, _)) => Ok(()),
                Ok((Err(_), _, _)) => Err(Error::Eof),
            },
        }
    }

    async fn apply_pos(&mut self) -> Result<()> {
        if !self.apply_corner_pos().await {
            self.apply_state_pos().await?;
        }
        Ok(())
    }

    /// Handles the corner values; returns false when the position is a
    /// per-journal map.
    async fn apply_corner_pos(&mut self) -> bool {
        let p = self.state.pos.to_lowercase();
        let pos = if p == "tail" {
            JournalPos::TAIL
        } else if p == "head" || p.is_empty() {
            JournalPos::HEAD
        } else {
            return false;
        };
        for desc in &self.descs {
            desc.it.lock().await.set_pos(pos);
        }
        true
    }

    async fn apply_state_pos(&mut self) -> Result<()> {
        // Parse the whole map before seeking anything, so a malformed
        // position leaves every iterator untouched.
        let map = parse_pos_entries(&self.state.pos)?;
        for desc in &self.descs {
            if let Some(&pos) = map.get(&desc.journal_id) {
                desc.it.lock().await.set_pos(pos);
            }
        }
        Ok(())
    }

}

fn parse_pos_entries(s: &str) -> Result<HashMap<JournalId, JournalPos>> {
    let mut map = HashMap::new();
    for entry in s.split(':') {
        let (id, pos) = entry.split_once('=').ok_or_else(|| {
            Error::Parse(format!(
                "position entry \"{}\" is not <journal-id>=<pos>",
                entry
            ))
        })?;
        map.insert(id.to_string(), pos.parse()?);
    }
    Ok(map)
}
