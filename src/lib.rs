//! # docdex
//!
//! **A transactional hybrid full-text search core for document stores.**
//!
//! docdex keeps a persistent search projection (normalized title, author,
//! mime and metadata text plus raw metadata JSON) consistent with an
//! authoritative file aggregate, and answers ranked queries over that
//! projection with snippets, highlights, facets and autocomplete. Storage
//! is embedded SQLite with FTS5; every projection mutation is covered by a
//! write-ahead journal so a crash mid-write replays to the same state.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────────┐
//! │ FileStore  │──▶│ SearchIndexer │──▶│  SQLite (FTS5)    │
//! │ (aggregate)│   │ + Coordinator │   │ projection + WAJ  │
//! └────────────┘   └──────┬───────┘   └─────────┬─────────┘
//!                         │                     │
//!                  ┌──────▼───────┐      ┌──────▼───────┐
//!                  │   Reindex    │      │    Query     │
//!                  │  Processor   │      │  Services    │
//!                  └──────────────┘      └──────────────┘
//! ```
//!
//! ## Write path
//!
//! 1. A file mutation reaches [`indexer::SearchIndexer`] (immediate mode)
//!    or records an intent in the [`queue`] (deferred mode).
//! 2. The [`writer::ProjectionWriter`] logs a write-ahead entry, applies a
//!    guarded upsert to `search_document` and its FTS/trigram companions,
//!    and clears the entry in the same transaction.
//! 3. A guarded upsert that matches zero rows is disambiguated into
//!    `StaleProjectionUpdate` (a competing writer won) or
//!    `AnalyzerOrContentDrift` (only the recorded hashes moved); the
//!    [`coordinator::IndexCoordinator`] repairs drift with a force replace.
//! 4. On startup, [`journal::WriteAheadJournal::replay_pending`] replays
//!    whatever a crash left behind; poison entries land in the dead-letter
//!    queue with a reason.
//!
//! ## Read path
//!
//! Queries run only against the projection: a BM25-weighted MATCH over the
//! FTS5 table, an optional trigram fallback for typo tolerance, and a
//! pluggable merge strategy that folds both result sets into one ranking.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`model`] | Core data types: `FileDocument`, `SearchHit`, results |
//! | [`error`] | `IndexError` kinds and busy/corruption classification |
//! | [`analyzer`] | Unicode normalization, tokenization, stopwords, stemming |
//! | [`signature`] | Drift-detection signatures (analyzer version, token hash) |
//! | [`db`] | SQLite connection pool with pragma priming and reset |
//! | [`schema`] | Idempotent schema migrations |
//! | [`capability`] | FTS schema capability snapshot |
//! | [`scope`] | Explicit write scopes with guard tokens |
//! | [`journal`] | Write-ahead journal, replay and dead-letter queue |
//! | [`writer`] | Guarded transactional projection writes |
//! | [`coordinator`] | Immediate/deferred indexing and the reindex algorithm |
//! | [`queue`] | Reindex queue persistence |
//! | [`processor`] | Background batch processor with backoff and timeouts |
//! | [`query`] | Planning, lexical/trigram execution, merge, facets, suggest |
//! | [`history`] | Search history and favorites |
//! | [`indexer`] | Indexing facade for file mutations |
//! | [`health`] | DLQ-depth health reporting |
//! | [`store`] | `FileStore`/`Clock`/`TextExtractor` seams + memory store |
//! | [`engine`] | One-stop assembly of all of the above |

pub mod analyzer;
pub mod capability;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod health;
pub mod history;
pub mod indexer;
pub mod journal;
pub mod model;
pub mod processor;
pub mod query;
pub mod queue;
pub mod schema;
pub mod scope;
pub mod signature;
pub mod store;
pub mod writer;

pub use config::{load_config, Config, IndexingMode};
pub use engine::SearchEngine;
pub use error::{IndexError, Result};
pub use model::{FileDocument, FileId, HitSource, IndexUpdateResult, ReindexReason, SearchHit};
pub use store::{Clock, FileStore, MemoryFileStore, SystemClock, TextExtractor};
