//! # docpipe
//!
//! A document ingestion pipeline for retrieval-augmented AI systems.
//!
//! docpipe turns heterogeneous source files (PDF, markdown, plain text,
//! JSON) into normalized pages, overlapping chunks, embedding vectors, and
//! per-chunk citations, persisting everything through SQLite. Progress is
//! tracked as per-file, per-step events so a UI can poll a job and watch
//! each file move through parse → chunk → embed → cite.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌───────────────────────┐   ┌──────────┐
//! │  Sources  │──▶│ Parse cache   │──▶│ Chunk → Embed → Cite  │──▶│  SQLite   │
//! │ pdf/md/.. │   │ (content-addr)│   │  (per file, ordered)  │   │ jobs/docs │
//! └───────────┘   └──────────────┘   └───────────────────────┘   └────┬─────┘
//!                                                                     │
//!                                                              job + step events
//! ```
//!
//! ## Guarantees
//!
//! - **Idempotent parsing**: the cache is keyed by a digest of the file's
//!   bytes; identical files are parsed at most once, ever.
//! - **Deterministic chunking**: the same document and parameters always
//!   reproduce identical chunk boundaries, offsets, and indices.
//! - **Monotonic progress**: event statuses only move forward; a poller
//!   never sees `success` revert to `running`.
//! - **Partial-failure isolation**: one corrupt file fails its own steps and
//!   contributes zero chunks; sibling files are unaffected.
//!
//! ## Quick Start
//!
//! ```bash
//! docpipe init                                  # create database
//! docpipe submit ./docs --collection handbook   # enqueue an ingestion job
//! docpipe worker --once                         # process pending jobs
//! docpipe status <job-id>                       # poll per-step progress
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy (file-scoped vs job-fatal) |
//! | [`cache`] | Content-addressable parse cache |
//! | [`parser`] | Format dispatch and text extraction |
//! | [`chunker`] | Sliding-window chunk assembly |
//! | [`embedder`] | Embedding backend abstraction |
//! | [`citation`] | Citation enrichment |
//! | [`repo`] | SQLite repository (jobs, documents, chunks, events) |
//! | [`pipeline`] | Per-job orchestration and file fan-out |
//! | [`worker`] | Background job loop |
//! | [`service`] | Submission, status, cancel, delete, previews |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod chunker;
pub mod citation;
pub mod config;
pub mod db;
pub mod embedder;
pub mod error;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod repo;
pub mod service;
pub mod worker;
