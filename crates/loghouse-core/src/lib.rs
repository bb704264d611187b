//! Core types for the Loghouse streaming log database.
//!
//! This crate holds the small value types shared by the journal storage
//! layer and the query engine: log events, tag lines, journal positions,
//! and the unified error enum. It deliberately has no I/O of its own.

pub mod error;
pub mod event;
pub mod hash;
pub mod pos;
pub mod tag;

pub use error::{Error, Result};
pub use event::LogEvent;
pub use pos::JournalPos;
pub use tag::{TagLine, TagSet};

/// Stable identifier of a journal's on-disk directory, assigned by the
/// tag index. Rendered as lowercase hex of the tag-line hash.
pub type JournalId = String;
