//! Vector memory for monthly insights
//!
//! One embedding row per insight; cosine top-K retrieval strictly scoped
//! to the owning user.

pub mod vector;

pub use vector::{InMemoryVectorStore, PgVectorStore, VectorStore};
