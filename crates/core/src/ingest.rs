use crate::chunking::{normalize_whitespace, split_text_into_chunks, ChunkingConfig};
use crate::extractor::PdfExtractor;
use crate::{ChunkRecord, IngestError, IngestionOptions, RealmTag};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Coarse keyword classifier for chunk realms. Finance wins over medical
/// when both match.
#[derive(Debug, Clone)]
pub struct RealmClassifier {
    finance: Regex,
    medical: Regex,
}

impl RealmClassifier {
    pub fn new(options: &IngestionOptions) -> Result<Self, IngestError> {
        Ok(Self {
            finance: Regex::new(options.finance_regex)?,
            medical: Regex::new(options.medical_regex)?,
        })
    }

    pub fn classify(&self, text: &str, filename: &str) -> RealmTag {
        if self.finance.is_match(filename) || self.finance.is_match(text) {
            RealmTag::Finance
        } else if self.medical.is_match(filename) || self.medical.is_match(text) {
            RealmTag::Medical
        } else {
            RealmTag::General
        }
    }
}

/// Drops chunks whose whitespace-normalized text already appeared earlier in
/// the same document. Applying it to its own output changes nothing.
pub fn dedup_chunks(chunks: Vec<(String, ChunkRecord)>) -> Vec<(String, ChunkRecord)> {
    let mut seen = HashSet::new();
    chunks
        .into_iter()
        .filter(|(text, record)| {
            let fresh = seen.insert(normalize_whitespace(text));
            if !fresh {
                debug!(page = record.page_number, chunk_id = %record.chunk_id, "skipping duplicate chunk");
            }
            fresh
        })
        .collect()
}

/// Turns one uploaded document into `(chunk_text, metadata)` pairs.
pub struct IngestionCoordinator<X>
where
    X: PdfExtractor,
{
    extractor: X,
    chunking: ChunkingConfig,
    classifier: RealmClassifier,
}

impl<X> IngestionCoordinator<X>
where
    X: PdfExtractor,
{
    pub fn new(extractor: X, options: IngestionOptions) -> Result<Self, IngestError> {
        options.chunking.validate()?;
        let classifier = RealmClassifier::new(&options)?;
        Ok(Self {
            extractor,
            chunking: options.chunking,
            classifier,
        })
    }

    /// Extracts, chunks, tags and deduplicates a document.
    ///
    /// Never fails: a document that cannot be parsed is logged and yields an
    /// empty vector, which callers treat as "nothing ingested".
    pub fn process(&self, bytes: &[u8], filename: &str) -> Vec<(String, ChunkRecord)> {
        info!(filename, size = bytes.len(), "processing document");

        let pages = match self.extractor.extract_pages(bytes) {
            Ok(pages) => pages,
            Err(error) => {
                warn!(filename, %error, "failed to open document, nothing ingested");
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for page in pages {
            if page.text.trim().is_empty() {
                warn!(filename, page = page.number, "page has no text content");
                continue;
            }

            let page_chunks = split_text_into_chunks(&page.text, self.chunking);
            debug!(page = page.number, chunk_count = page_chunks.len(), "page chunked");

            for (local_index, chunk_text) in page_chunks.into_iter().enumerate() {
                if chunk_text.trim().is_empty() {
                    continue;
                }

                let record = ChunkRecord {
                    chunk_id: format!("{filename}_p{}_c{local_index}", page.number),
                    source_document: filename.to_string(),
                    page_number: page.number,
                    sequence_index: 0,
                    text: chunk_text.clone(),
                    realm_tag: Some(self.classifier.classify(&chunk_text, filename)),
                };
                candidates.push((chunk_text, record));
            }
        }

        let mut chunks = dedup_chunks(candidates);
        for (sequence, (_, record)) in chunks.iter_mut().enumerate() {
            record.sequence_index = sequence as u64;
        }

        info!(filename, chunk_count = chunks.len(), "unique chunks created");
        chunks
    }
}
