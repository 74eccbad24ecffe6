pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generator;
pub mod index;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod retrieval;
pub mod store;
pub mod traits;

pub use chunking::{
    normalize_whitespace, pack_sentences, split_text_into_chunks, split_with, ChunkingConfig,
    SentenceSplitter, UnicodeSentenceSplitter,
};
pub use embeddings::{CharacterNgramEmbedder, Embedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{IngestError, SearchError};
pub use extractor::{LopdfExtractor, PageText, PdfExtractor};
pub use generator::{ChatCompletionsGenerator, ExtractiveGenerator, UNKNOWN_ANSWER};
pub use index::{FlatIndex, Neighbor};
pub use ingest::{dedup_chunks, digest_bytes, discover_pdf_files, IngestionCoordinator, RealmClassifier};
pub use models::{
    AskResponse, ChunkRecord, IngestionOptions, IngestionSummary, RealmTag, RetrievalOptions,
    SearchResult, UploadResponse, UploadStatus, DEFAULT_NAMESPACE,
};
pub use orchestrator::{build_context, IngestionReport, RagPipeline, SkippedPdf};
pub use retrieval::{deduplicate_results, jaccard_similarity, RetrievalEngine};
pub use store::IndexStore;
pub use traits::{AnswerGenerator, VectorStore};
