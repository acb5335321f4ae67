use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tiktoken_rs::CoreBPE;
use tracing::{debug, info, warn};

use crag_core::config::AppConfig;
use crag_core::error::{CragError, Result};
use crag_core::traits::EmbeddingProvider;

use crate::index::VectorIndex;

/// File extensions picked up when walking a corpus directory.
const INDEXED_EXTENSIONS: &[&str] = &["md", "markdown", "txt", "rst"];

/// Split points tried in order, coarsest first.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " "];

fn tokenizer() -> &'static CoreBPE {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    TOKENIZER.get_or_init(|| {
        tiktoken_rs::cl100k_base().expect("Failed to load cl100k_base tokenizer")
    })
}

fn count_tokens(text: &str) -> usize {
    tokenizer().encode_ordinary(text).len()
}

/// Split `text` into chunks of at most `chunk_tokens` tokens (cl100k_base),
/// preferring paragraph, then line, then sentence, then word boundaries.
/// Consecutive chunks share up to `overlap` tokens of trailing pieces.
pub fn chunk_text(text: &str, chunk_tokens: usize, overlap: usize) -> Vec<String> {
    let chunk_tokens = chunk_tokens.max(1);
    let overlap = overlap.min(chunk_tokens / 2);

    let pieces: Vec<(String, usize)> = split_recursive(text, chunk_tokens, SEPARATORS)
        .into_iter()
        .map(|p| {
            let n = count_tokens(&p);
            (p, n)
        })
        .collect();

    let mut chunks = Vec::new();
    let mut window: Vec<(String, usize)> = Vec::new();
    let mut window_tokens = 0usize;

    for (piece, n) in pieces {
        if window_tokens + n > chunk_tokens && !window.is_empty() {
            push_chunk(&mut chunks, &window);
            // Keep a tail of pieces as overlap for the next chunk
            while !window.is_empty() && (window_tokens > overlap || window_tokens + n > chunk_tokens) {
                let (_, dropped) = window.remove(0);
                window_tokens -= dropped;
            }
        }
        window_tokens += n;
        window.push((piece, n));
    }
    push_chunk(&mut chunks, &window);

    chunks
}

fn push_chunk(chunks: &mut Vec<String>, window: &[(String, usize)]) {
    let joined: String = window.iter().map(|(p, _)| p.as_str()).collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Break text into pieces that each fit in `max` tokens. Separators stay
/// attached to the piece they end so joining pieces restores the text.
fn split_recursive(text: &str, max: usize, separators: &[&str]) -> Vec<String> {
    if count_tokens(text) <= max {
        return vec![text.to_string()];
    }
    let Some((sep, rest)) = separators.split_first() else {
        // A single oversized word; keep it whole
        return vec![text.to_string()];
    };

    let mut out = Vec::new();
    for part in text.split_inclusive(sep) {
        if count_tokens(part) <= max {
            out.push(part.to_string());
        } else {
            out.extend(split_recursive(part, max, rest));
        }
    }
    out
}

/// Summary of one ingestion pass.
#[derive(Debug, Default, Clone)]
pub struct IngestReport {
    pub files: usize,
    pub chunks: usize,
    pub skipped: Vec<PathBuf>,
}

/// Builds the local index from a directory (or single file) of documents.
pub struct Ingestor {
    index: VectorIndex,
    embedder: Arc<dyn EmbeddingProvider>,
    chunk_tokens: usize,
    overlap: usize,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(index: VectorIndex, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            index,
            embedder,
            chunk_tokens: 250,
            overlap: 0,
            batch_size: 32,
        }
    }

    pub fn from_config(
        index: VectorIndex,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &AppConfig,
    ) -> Self {
        Self::new(index, embedder)
            .with_chunking(config.retrieval.chunk_tokens, config.retrieval.chunk_overlap)
            .with_batch_size(config.embedding.batch_size)
    }

    pub fn with_chunking(mut self, chunk_tokens: usize, overlap: usize) -> Self {
        self.chunk_tokens = chunk_tokens;
        self.overlap = overlap;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// Index every supported file under `root`. Each file replaces its
    /// previous chunks, so re-running is safe.
    pub async fn ingest_path(&self, root: &Path) -> Result<IngestReport> {
        if !root.exists() {
            return Err(CragError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", root.display()),
            )));
        }

        let mut report = IngestReport::default();
        for path in collect_files(root) {
            let source = source_name(&path);
            let text = match std::fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                    report.skipped.push(path);
                    continue;
                }
            };

            let chunks = chunk_text(&text, self.chunk_tokens, self.overlap);
            if chunks.is_empty() {
                debug!(source = %source, "Skipping empty file");
                report.skipped.push(path);
                continue;
            }

            let written = self.ingest_chunks(&source, chunks).await?;
            report.files += 1;
            report.chunks += written;
        }

        info!(
            files = report.files,
            chunks = report.chunks,
            skipped = report.skipped.len(),
            "Ingestion complete"
        );
        Ok(report)
    }

    /// Embed `chunks` in batches and store them under `source`.
    pub async fn ingest_chunks(&self, source: &str, chunks: Vec<String>) -> Result<usize> {
        let mut rows: Vec<(String, Vec<f32>)> = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let vectors = self.embedder.embed(batch).await?;
            if vectors.len() != batch.len() {
                return Err(CragError::Embedding(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    vectors.len()
                )));
            }
            rows.extend(batch.iter().cloned().zip(vectors));
        }
        self.index.replace_source(source, &rows)
    }
}

fn collect_files(root: &Path) -> Vec<PathBuf> {
    if root.is_file() {
        return vec![root.to_path_buf()];
    }
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| INDEXED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    files
}

/// Key a file by its absolute path so separate roots never share a source.
fn source_name(path: &Path) -> String {
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    absolute.to_string_lossy().replace('\\', "/")
}
