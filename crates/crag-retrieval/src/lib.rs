pub mod embeddings;
pub mod index;
pub mod ingest;
pub mod local;
pub mod web;

pub use embeddings::{cosine_similarity, HttpEmbeddingProvider};
pub use index::VectorIndex;
pub use ingest::{chunk_text, Ingestor, IngestReport};
pub use local::LocalIndexSource;
pub use web::TavilySearch;
