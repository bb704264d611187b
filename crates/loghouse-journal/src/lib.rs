//! Loghouse Journal Storage
//!
//! This crate implements the on-disk storage layer for Loghouse: per-tag
//! journals stored as append-only chunk files, the bounded file-descriptor
//! pool that backs all reads, and the forward iterator the query engine
//! drives.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────┐
//! │ JournalController │  one per data directory
//! └────────┬──────────┘
//!          │ get_or_create(id)
//!          ▼
//! ┌───────────────────┐      ┌──────────────┐
//! │     Journal       │◀────▶│   FdPool     │  bounded, cached readers
//! │  chunk table +    │      └──────┬───────┘
//! │  append + watch   │             │
//! └────────┬──────────┘             ▼
//!          │ iterator()          disk (chunk files)
//!          ▼
//! ┌───────────────────┐
//! │ JournalIterator   │  get / next / set_pos / release
//! └───────────────────┘
//! ```
//!
//! Reads never open files directly: every `JournalIterator` borrows a
//! buffered reader from the shared pool and returns it on `release`, so
//! the total number of open handles stays bounded no matter how many
//! cursors exist.

pub mod chunk;
pub mod config;
pub mod controller;
pub mod fdpool;
pub mod iterator;
pub mod journal;

pub use config::JournalConfig;
pub use controller::JournalController;
pub use fdpool::{FdPool, FileReader};
pub use iterator::JournalIterator;
pub use journal::Journal;
