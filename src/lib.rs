//! # RAG Lifecycle
//!
//! Per-document vector indexes for retrieval-augmented generation, with a
//! managed lifecycle: content-addressed deduplication, crash-safe staged
//! builds, generation swaps that never disturb concurrent readers,
//! corruption analysis with graded repair, and a response cache that is
//! invalidated by generation.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────┐
//!   build/query ───▶ │ Coordinator  │ per-document build locks
//!                    └──┬───┬───┬───┘
//!          ┌────────────┘   │   └──────────────┐
//!          ▼                ▼                  ▼
//!   ┌─────────────┐  ┌─────────────┐   ┌──────────────┐
//!   │IndexBuilder │  │ QueryEngine │   │RecoveryService│
//!   │hash→chunk→  │  │ LRU of      │   │analyze→repair │
//!   │embed→stage  │  │ loaded gens │   └──────┬───────┘
//!   └──────┬──────┘  └──────┬──────┘          │
//!          ▼                ▼                 ▼
//!   ┌────────────────────────────────────────────────┐
//!   │ VectorIndexManager · FileManager · IndexRegistry│
//!   │  active/doc-<id>-g<gen>/   SQLite index_records │
//!   └────────────────────────────────────────────────┘
//! ```
//!
//! Queries consult the [`cache::RAGCacheService`] before the query engine.
//!
//! ## Quick Start
//!
//! ```bash
//! ragctl init                       # default config, database, storage
//! ragctl add ./notes/paper.md       # register a document
//! ragctl build 1                    # index it
//! ragctl query 1 "What is the main result?"
//! ragctl health
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Error taxonomy |
//! | [`hashing`] | Content and file fingerprints |
//! | [`artifacts`] | On-disk index format |
//! | [`file_manager`] | Artifact directories and verification |
//! | [`registry`] | Index records |
//! | [`vector_index`] | Staging, commit, retirement |
//! | [`builder`] | Index builds |
//! | [`query`] | Retrieval-augmented queries |
//! | [`recovery`] | Corruption analysis and repair |
//! | [`cache`] | Response cache |
//! | [`coordinator`] | Lifecycle facade |
//! | [`documents`] | SQLite document repository |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | LLM providers |
//! | [`retry`] | Backoff for provider calls |
//! | [`logging`] | Tracing setup |
//! | [`commands`] | CLI command implementations |

pub mod artifacts;
pub mod builder;
pub mod cache;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod error;
pub mod file_manager;
pub mod hashing;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod query;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod vector_index;

pub use coordinator::Coordinator;
pub use error::ProcessingError;
