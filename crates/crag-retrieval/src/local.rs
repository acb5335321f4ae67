use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crag_core::error::{CragError, Result};
use crag_core::traits::{EmbeddingProvider, EvidenceSource};
use crag_core::types::Passage;

use crate::index::VectorIndex;

/// Nearest-neighbour lookup against a pre-built [`VectorIndex`].
pub struct LocalIndexSource {
    index: Option<VectorIndex>,
    path: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    top_k: usize,
}

impl LocalIndexSource {
    /// Attach to the index at `path`. A missing index is not an error here;
    /// every `fetch` reports it as `IndexUnavailable` instead.
    pub fn open(path: &Path, embedder: Arc<dyn EmbeddingProvider>, top_k: usize) -> Self {
        let index = match VectorIndex::open_existing(path) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Local index not available");
                None
            }
        };
        Self {
            index,
            path: path.to_path_buf(),
            embedder,
            top_k,
        }
    }

    pub fn from_index(index: VectorIndex, embedder: Arc<dyn EmbeddingProvider>, top_k: usize) -> Self {
        Self {
            index: Some(index),
            path: PathBuf::from(":memory:"),
            embedder,
            top_k,
        }
    }
}

impl EvidenceSource for LocalIndexSource {
    fn name(&self) -> &str {
        "local_index"
    }

    fn fetch(&self, question: &str) -> BoxFuture<'_, Result<Vec<Passage>>> {
        let question = question.to_string();
        Box::pin(async move {
            let index = self.index.as_ref().ok_or_else(|| {
                CragError::IndexUnavailable(format!(
                    "no index at {} (run `crag index` first)",
                    self.path.display()
                ))
            })?;

            if index.is_empty()? {
                return Err(CragError::IndexUnavailable(format!(
                    "index at {} has no documents",
                    self.path.display()
                )));
            }

            let query_vec = self
                .embedder
                .embed(&[question])
                .await
                .map_err(|e| CragError::IndexUnavailable(e.to_string()))?
                .into_iter()
                .next()
                .ok_or_else(|| CragError::IndexUnavailable("embedder returned no vector".into()))?;

            // Mismatched vectors score 0.0 against everything
            if let Some(dims) = index.dimensions()? {
                if dims != query_vec.len() {
                    return Err(CragError::IndexUnavailable(format!(
                        "index built with {}-dim embeddings, embedder produces {}; rebuild with `crag index`",
                        dims,
                        query_vec.len()
                    )));
                }
            }

            let hits = index.search(&query_vec, self.top_k)?;
            debug!(
                hits = hits.len(),
                best = hits.first().map(|(s, _)| *s).unwrap_or_default(),
                "Local index lookup"
            );

            Ok(hits.into_iter().map(|(_, passage)| passage).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crag_core::types::SourceKind;
    use crag_test_utils::HashEmbedder;

    fn seeded_index(embedder: &HashEmbedder) -> VectorIndex {
        let index = VectorIndex::in_memory().unwrap();
        let docs = [
            ("prompting.md", "Prompt engineering steers model behaviour with instructions."),
            ("agents.md", "Autonomous agents combine planning memory and tool use."),
            ("vectors.md", "Vector databases store embeddings for similarity search."),
        ];
        for (source, text) in docs {
            index
                .replace_source(source, &[(text.to_string(), embedder.embed_one(text))])
                .unwrap();
        }
        index
    }

    #[tokio::test]
    async fn test_fetch_returns_top_k_best_first() {
        let embedder = HashEmbedder::new(128);
        let index = seeded_index(&embedder);
        let source = LocalIndexSource::from_index(index, Arc::new(embedder), 2);

        let passages = source.fetch("What is prompt engineering?").await.unwrap();
        assert_eq!(passages.len(), 2);
        assert_eq!(passages[0].source, "prompting.md");
        assert!(passages.iter().all(|p| p.kind == SourceKind::LocalIndex));
    }

    #[tokio::test]
    async fn test_fetch_rejects_embedding_size_change() {
        let index = seeded_index(&HashEmbedder::new(128));
        let source = LocalIndexSource::from_index(index, Arc::new(HashEmbedder::new(64)), 2);

        let err = source.fetch("prompt engineering").await.unwrap_err();
        assert!(matches!(err, CragError::IndexUnavailable(ref m) if m.contains("128") && m.contains("64")));
    }

    #[tokio::test]
    async fn test_fetch_missing_index_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = LocalIndexSource::open(
            &dir.path().join("absent.db"),
            Arc::new(HashEmbedder::new(8)),
            4,
        );
        let err = source.fetch("anything").await.unwrap_err();
        assert!(matches!(err, CragError::IndexUnavailable(_)));
    }

    #[tokio::test]
    async fn test_fetch_empty_index_is_unavailable() {
        let source = LocalIndexSource::from_index(
            VectorIndex::in_memory().unwrap(),
            Arc::new(HashEmbedder::new(8)),
            4,
        );
        let err = source.fetch("anything").await.unwrap_err();
        assert!(err.is_source_unavailable());
    }
}
