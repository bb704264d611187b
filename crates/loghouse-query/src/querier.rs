//! Querier - Query Execution and Cursor Sessions
//!
//! Engine-side execution of one read request. The RPC surface lives
//! elsewhere; it hands a [`QueryRequest`] to [`Querier::query`] and ships
//! the [`QueryResult`] back, echoing `next` so the client can page through
//! the stream without the server keeping any state it cannot rebuild.
//!
//! ## Sessions
//!
//! Committed cursors are parked by request id between calls. A follow-up
//! request with the same id and query reuses the parked cursor through
//! `apply_state` - cheap, because a committed cursor holds no file
//! handles - while a request for a different query simply builds a fresh
//! one. Parked cursors that sit idle longer than the configured timeout
//! are closed by the sweeper.
//!
//! ## Wait-for-data
//!
//! A request whose first `get` hits EOF on every source may block for up
//! to its `wait_timeout_secs` (clamped to 60s) until a source journal
//! signals new records. Expiry returns an empty result with the same
//! position, not an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use loghouse_core::Result;
use loghouse_journal::JournalController;

use crate::cursor::{Cursor, CursorConfig, CursorState, MAX_WAIT};
use crate::lql;
use crate::mixer::TaggedEvent;
use crate::tindex::TagIndex;

/// A request for reading records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Server-assigned session id. Zero on a fresh query; echoed back in
    /// the result so follow-ups map onto the same cursor.
    pub req_id: u64,

    /// The query line: `<sources> [where <predicate>]`.
    pub query: String,

    /// Resume position. Empty means head.
    pub pos: String,

    /// How long to wait for new data when the read starts at EOF.
    /// Clamped to 60 seconds.
    pub wait_timeout_secs: u64,

    /// Maximum records returned by this call.
    pub limit: usize,
}

/// Result of one query call.
#[derive(Debug)]
pub struct QueryResult {
    /// Records matched, in merge order, each with its source tag line.
    pub events: Vec<TaggedEvent>,

    /// Request for the next page: fresh position, echoed id.
    pub next: QueryRequest,
}

#[derive(Debug, Clone)]
pub struct QuerierConfig {
    pub cursor: CursorConfig,

    /// Parked cursors idle longer than this are closed (default: 5 min).
    pub idle_timeout: Duration,
}

impl Default for QuerierConfig {
    fn default() -> Self {
        Self {
            cursor: CursorConfig::default(),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

struct Session {
    cursor: Cursor,
    parked_at: Instant,
}

/// Executes queries against the journal store.
pub struct Querier {
    tindex: Arc<dyn TagIndex>,
    ctrl: Arc<JournalController>,
    config: QuerierConfig,
    sessions: AsyncMutex<HashMap<u64, Session>>,
    next_id: AtomicU64,
}

impl Querier {
    pub fn new(tindex: Arc<dyn TagIndex>, ctrl: Arc<JournalController>) -> Self {
        Self::with_config(tindex, ctrl, QuerierConfig::default())
    }

    pub fn with_config(
        tindex: Arc<dyn TagIndex>,
        ctrl: Arc<JournalController>,
        config: QuerierConfig,
    ) -> Self {
        Self {
            tindex,
            ctrl,
            config,
            sessions: AsyncMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Executes one read request: up to `limit` matching records from the
    /// requested position, honoring the wait-timeout at EOF, then commits
    /// and parks the cursor.
    pub async fn query(&self, ctx: &CancellationToken, req: &QueryRequest) -> Result<QueryResult> {
        let (sources, where_) = lql::split_query(&req.query);
        let id = if req.req_id != 0 {
            req.req_id
        } else {
            self.next_id.fetch_add(1, Ordering::Relaxed)
        };
        let state = CursorState {
            id,
            sources,
            where_,
            pos: req.pos.clone(),
        };

        let mut cursor = self.checkout(ctx, state).await?;
        let wait = Duration::from_secs(req.wait_timeout_secs).min(MAX_WAIT);
        let mut events = Vec::new();
        let mut waited = false;

        while events.len() < req.limit {
            match cursor.get(ctx).await {
                Ok(te) => {
                    events.push(te);
                    cursor.next(ctx).await;
                }
                Err(e) if e.is_eof() => {
                    if events.is_empty() && !wait.is_zero() && !waited {
                        waited = true;
                        match cursor.wait_for_data(ctx, wait).await {
                            Ok(()) => continue,
                            Err(e) if e.is_eof() => break,
                            Err(e) => {
                                cursor.close().await;
                                return Err(e);
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    cursor.close().await;
                    return Err(e);
                }
            }
        }

        let state = match cursor.commit(ctx).await {
            Ok(state) => state,
            Err(e) => {
                cursor.close().await;
                return Err(e);
            }
        };
        self.park(cursor).await;

        tracing::debug!(
            req_id = id,
            returned = events.len(),
            pos = %state.pos,
            "query served"
        );

        Ok(QueryResult {
            events,
            next: QueryRequest {
                req_id: id,
                query: req.query.clone(),
                pos: state.pos,
                wait_timeout_secs: req.wait_timeout_secs,
                limit: req.limit,
            },
        })
    }

    /// Reuses the parked cursor for this id when the query matches,
    /// otherwise builds a fresh one.
    async fn checkout(&self, ctx: &CancellationToken, state: CursorState) -> Result<Cursor> {
        let parked = self.sessions.lock().await.remove(&state.id);
        if let Some(mut session) = parked {
            match session.cursor.apply_state(state.clone()).await {
                Ok(()) => return Ok(session.cursor),
                Err(e) => {
                    tracing::debug!(
                        req_id = state.id,
                        error = %e,
                        "parked cursor does not fit the request, rebuilding"
                    );
                    session.cursor.close().await;
                }
            }
        }
        Cursor::open(ctx, state, &self.tindex, &self.ctrl, &self.config.cursor).await
    }

    async fn park(&self, cursor: Cursor) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            cursor.id(),
            Session {
                cursor,
                parked_at: Instant::now(),
            },
        );
    }

    /// Closes and forgets the session for `id`, if any.
    pub async fn close_session(&self, id: u64) {
        if let Some(mut session) = self.sessions.lock().await.remove(&id) {
            session.cursor.close().await;
        }
    }

    /// Number of parked sessions (for monitoring and tests).
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Closes every session idle longer than the configured timeout.
    pub async fn sweep_idle(&self) {
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<u64> = sessions
            .iter()
            .filter(|(_, s)| s.parked_at.elapsed() > self.config.idle_timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            if let Some(mut session) = sessions.remove(&id) {
                session.cursor.close().await;
                tracing::debug!(req_id = id, "expired idle cursor");
            }
        }
    }

    /// Spawns the background idle sweep. Abort the handle on shutdown.
    pub fn start_idle_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.sweep_idle().await;
            }
        })
    }

    /// Closes every parked session.
    pub async fn close(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, mut session) in sessions.drain() {
            session.cursor.close().await;
        }
    }
}
