//! Error Types for Loghouse
//!
//! This module defines the error type shared by every loghouse crate.
//!
//! ## Error Categories
//!
//! ### Control-flow signals
//! - `Eof`: a reader ran out of records, or a wait-timeout expired with no
//!   new data. Expected during normal operation and never logged as an error.
//! - `Canceled`: the caller's cancellation token fired while an operation
//!   was suspended. Also expected control flow.
//!
//! ### State errors
//! - `WrongState`: the pool or cursor is closed, a client id is registered
//!   twice, or an apply-state targets a different query.
//!
//! ### User-facing errors
//! - `Parse`: a malformed position string or query expression.
//! - `NoSources` / `TooManySources`: the tag expression resolved to zero
//!   journals, or to more than the configured cap.
//!
//! ### Data errors
//! - `Corrupt`: a chunk frame failed its CRC or length check.
//! - `Io`: disk errors, surfaced verbatim with `#[from]`.
//!
//! ## Usage
//!
//! All fallible operations return `Result<T>` which is aliased to
//! `Result<T, Error>`, so `?` propagation works across crate boundaries.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("wrong state: {0}")]
    WrongState(&'static str),

    #[error("operation canceled")]
    Canceled,

    #[error("end of data")]
    Eof,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no sources match the expression \"{0}\"")]
    NoSources(String),

    #[error("too many sources: {found} matched, the limit is {limit}")]
    TooManySources { found: usize, limit: usize },

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this is the end-of-data signal.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }

    /// Whether this is the cancellation signal.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}
