//! Loghouse Query Engine
//!
//! The read path of the Loghouse streaming log database: per-journal
//! iterators merged into one time-ordered stream, session cursors with
//! opaque resume positions, and the querier that executes paged read
//! requests.
//!
//! ## Dataflow
//!
//! ```text
//! Querier ──▶ Cursor ──▶ Mixer tournament ──▶ {JournalIterator…} ──▶ FdPool ──▶ disk
//! ```
//!
//! A cursor is single-threaded from the client's perspective; cursors for
//! different queries run independently and share only the FD pool and the
//! tag index.

pub mod cursor;
pub mod lql;
pub mod mixer;
pub mod querier;
pub mod tindex;

pub use cursor::{Cursor, CursorConfig, CursorState};
pub use lql::{parse_source_expr, parse_where, split_query, TagExpr, WhereExpr};
pub use mixer::{build_merge, earliest, latest, EventSource, Mixer, TaggedEvent};
pub use querier::{Querier, QuerierConfig, QueryRequest, QueryResult};
pub use tindex::{InMemoryTagIndex, TagIndex};
