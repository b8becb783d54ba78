//! Search layer facade.
//!
//! - **[`embedder`]**: `EmbeddingClient` boundary and its error type.
//! - **[`http_embedder`]**: client for the sentence-embedding service.
//! - **[`hash_embedder`]**: FNV-1a feature hashing embedder (deterministic fallback).
//! - **[`vector_index`]**: in-memory vector index with `LVIX` snapshots.
//! - **[`hybrid`]**: predicate filtering combined with nearest-neighbour ranking.

pub mod embedder;
pub mod hash_embedder;
pub mod http_embedder;
pub mod hybrid;
pub mod vector_index;
