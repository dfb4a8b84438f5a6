//! # DocChat
//!
//! Document-grounded chat under a per-user token quota.
//!
//! ## Architecture
//!
//! ```text
//! upload ──▶ DocumentStore ──▶ extract ─▶ chunk ─▶ embed ─▶ VectorIndex
//!                                                               │
//! message ─▶ ChatOrchestrator ─▶ QuotaLedger.reserve            │
//!                 │                                             ▼
//!                 ├──────────▶ Retriever ◀──────────── per-document indexes
//!                 ├──────────▶ Generator (chat completions)
//!                 └──────────▶ QuotaLedger.reconcile ─▶ persisted turns
//! ```
//!
//! The domain types, chunker, vector index, quota rules, and prompt policy
//! live in `docchat-core`; this crate supplies configuration, SQLite
//! storage, the embedding and generation clients, and the services that
//! drive them.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite `Store` implementation |
//! | [`extract`] | Text extraction (plain text, PDF, DOCX) |
//! | [`embedding`] | Embedding providers |
//! | [`generation`] | Chat-completions client |
//! | [`documents`] | Ingestion pipeline and index lifecycle |
//! | [`retriever`] | Cross-document retrieval |
//! | [`ledger`] | Token quota ledger |
//! | [`chat`] | Chat turn orchestration |
//! | [`app`] | Service wiring |
//! | [`server`] | HTTP API |

pub mod app;
pub mod chat;
pub mod config;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod extract;
pub mod generation;
pub mod ledger;
pub mod migrate;
pub mod retriever;
pub mod server;
pub mod sqlite_store;
