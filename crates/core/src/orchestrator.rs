use crate::embeddings::Embedder;
use crate::extractor::PdfExtractor;
use crate::ingest::{digest_bytes, discover_pdf_files, IngestionCoordinator};
use crate::retrieval::RetrievalEngine;
use crate::traits::{AnswerGenerator, VectorStore};
use crate::{
    AskResponse, ChunkRecord, IngestError, IngestionSummary, SearchError, SearchResult,
    UploadResponse, UploadStatus,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Renders retrieved chunks as the generator's context, one block per chunk.
pub fn build_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .filter(|result| {
            !result.metadata.is_placeholder() && !result.metadata.text.trim().is_empty()
        })
        .map(|result| {
            let source = if result.metadata.source_document.is_empty() {
                "unknown"
            } else {
                result.metadata.source_document.as_str()
            };
            format!(
                "{} (Source: {}, page {})",
                result.metadata.text, source, result.metadata.page_number
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

pub struct IngestionReport {
    pub ingested: Vec<IngestionSummary>,
    pub skipped_files: Vec<SkippedPdf>,
}

/// Wires ingestion, retrieval and generation into the upload and ask flows.
pub struct RagPipeline<X, S, E, G>
where
    X: PdfExtractor,
    S: VectorStore,
    E: Embedder,
    G: AnswerGenerator,
{
    ingestion: IngestionCoordinator<X>,
    retrieval: RetrievalEngine<S, E>,
    generator: G,
}

impl<X, S, E, G> RagPipeline<X, S, E, G>
where
    X: PdfExtractor + Send + Sync,
    S: VectorStore + Send + Sync,
    E: Embedder + Send + Sync,
    G: AnswerGenerator + Send + Sync,
{
    pub fn new(
        ingestion: IngestionCoordinator<X>,
        retrieval: RetrievalEngine<S, E>,
        generator: G,
    ) -> Self {
        Self {
            ingestion,
            retrieval,
            generator,
        }
    }

    pub fn retrieval(&self) -> &RetrievalEngine<S, E> {
        &self.retrieval
    }

    /// Chunks, embeds and appends one document. `Ok(None)` means the document
    /// produced no chunks and nothing was written.
    pub async fn ingest_document(
        &self,
        namespace: &str,
        bytes: &[u8],
        filename: &str,
    ) -> Result<Option<IngestionSummary>, SearchError> {
        let chunks = self.ingestion.process(bytes, filename);
        if chunks.is_empty() {
            warn!(namespace, filename, "no chunks generated from document");
            return Ok(None);
        }

        let (texts, records): (Vec<String>, Vec<ChunkRecord>) = chunks.into_iter().unzip();
        let vectors = self.retrieval.embedder().embed_batch(&texts);
        let total_vectors = self
            .retrieval
            .store()
            .append(namespace, &vectors, &records)
            .await?;

        info!(namespace, filename, chunk_count = records.len(), total_vectors, "document ingested");
        Ok(Some(IngestionSummary {
            namespace: namespace.to_string(),
            filename: filename.to_string(),
            checksum: digest_bytes(bytes),
            chunk_count: records.len(),
            total_vectors,
            ingested_at: Utc::now(),
        }))
    }

    /// Upload flow: always answers with a status instead of an error.
    pub async fn upload(&self, namespace: &str, bytes: &[u8], filename: &str) -> UploadResponse {
        match self.ingest_document(namespace, bytes, filename).await {
            Ok(Some(summary)) => UploadResponse {
                status: UploadStatus::Completed,
                message: format!(
                    "{} chunks from {} indexed into '{}' (sha256 {})",
                    summary.chunk_count, filename, namespace, summary.checksum
                ),
                summary: Some(summary),
            },
            Ok(None) => UploadResponse {
                status: UploadStatus::Empty,
                message: format!("no text could be extracted from {filename}"),
                summary: None,
            },
            Err(err) => {
                error!(namespace, filename, error = %err, "upload failed");
                UploadResponse {
                    status: UploadStatus::Error,
                    message: err.to_string(),
                    summary: None,
                }
            }
        }
    }

    /// Ingests a single PDF or every PDF below a folder.
    pub async fn ingest_path(
        &self,
        namespace: &str,
        path: &Path,
    ) -> Result<IngestionReport, IngestError> {
        let files = if path.is_dir() {
            discover_pdf_files(path)
        } else {
            vec![path.to_path_buf()]
        };

        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no pdf files found in {}",
                path.display()
            )));
        }

        let mut ingested = Vec::new();
        let mut skipped_files = Vec::new();

        for file in files {
            let filename = file
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
                .ok_or_else(|| IngestError::MissingFileName(file.display().to_string()))?;

            let bytes = match tokio::fs::read(&file).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    skipped_files.push(SkippedPdf {
                        path: file,
                        reason: error.to_string(),
                    });
                    continue;
                }
            };

            let response = self.upload(namespace, &bytes, &filename).await;
            match response.summary {
                Some(summary) => ingested.push(summary),
                None => skipped_files.push(SkippedPdf {
                    path: file,
                    reason: response.message,
                }),
            }
        }

        Ok(IngestionReport {
            ingested,
            skipped_files,
        })
    }

    pub async fn search(
        &self,
        namespace: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }
        self.retrieval.retrieve(namespace, query, top_k).await
    }

    /// Ask flow: retrieve, assemble context, generate.
    pub async fn ask(
        &self,
        namespace: &str,
        question: &str,
        top_k: usize,
    ) -> Result<AskResponse, SearchError> {
        let hits = self.search(namespace, question, top_k).await?;
        let context = build_context(&hits);
        info!(namespace, hits = hits.len(), context_chars = context.len(), "context assembled");

        let answer = self.generator.generate(question, &context).await?;

        Ok(AskResponse {
            answer,
            sources: hits.into_iter().map(|hit| hit.metadata).collect(),
        })
    }
}
