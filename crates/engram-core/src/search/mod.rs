//! Search Module
//!
//! The HNSW vector store over event embeddings.

mod vector;

pub use vector::{
    VectorRecord, VectorSearchError, VectorSearchResult, VectorStore, record_id,
};
