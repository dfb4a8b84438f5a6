//! # DocChat Core
//!
//! Runtime-free logic for DocChat: data models, the error taxonomy, the
//! overlapping chunker, the embedding trait and vector math, per-document
//! vector indexes, the k-way retrieval merge, quota accounting rules,
//! prompt assembly, and the storage abstraction.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! Everything that performs I/O or needs a scheduler lives in the `docchat`
//! application crate and talks to this crate through the [`store::Store`]
//! and [`embedding::Embedder`] traits.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod prompt;
pub mod quota;
pub mod retrieve;
pub mod store;

pub use error::{DocChatError, Result};
