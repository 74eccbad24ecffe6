use crate::error::IngestError;
use tracing::debug;
use unicode_segmentation::UnicodeSegmentation;

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_OVERLAP_SENTENCES: usize = 2;

/// Size bound and overlap window for sentence-packed chunks.
///
/// `overlap_sentences` counts whole sentences, not characters: when a chunk
/// overflows, the next one is seeded with up to that many of the sentences
/// that preceded the overflowing sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap_sentences: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap_sentences: DEFAULT_OVERLAP_SENTENCES,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub trait SentenceSplitter {
    fn split_sentences(&self, text: &str) -> Vec<String>;
}

/// Splits on Unicode (UAX #29) sentence boundaries.
///
/// Whitespace is collapsed first so that hard line wraps from PDF extraction
/// do not end a sentence early.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnicodeSentenceSplitter;

impl SentenceSplitter for UnicodeSentenceSplitter {
    fn split_sentences(&self, text: &str) -> Vec<String> {
        let flattened = normalize_whitespace(text);
        flattened
            .unicode_sentences()
            .map(str::trim)
            .filter(|sentence| !sentence.is_empty())
            .map(str::to_string)
            .collect()
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn split_text_into_chunks(text: &str, config: ChunkingConfig) -> Vec<String> {
    split_with(&UnicodeSentenceSplitter, text, config)
}

pub fn split_with<S>(splitter: &S, text: &str, config: ChunkingConfig) -> Vec<String>
where
    S: SentenceSplitter + ?Sized,
{
    if text.trim().is_empty() {
        debug!("empty text passed to chunker");
        return Vec::new();
    }

    let sentences = splitter.split_sentences(text);
    let chunks = pack_sentences(&sentences, config);
    debug!(
        text_chars = text.chars().count(),
        sentence_count = sentences.len(),
        chunk_count = chunks.len(),
        "chunked text"
    );
    chunks
}

/// Greedily packs sentences into chunks of at most `chunk_size` characters.
///
/// A sentence is never split, so a single sentence longer than the bound
/// becomes a chunk of its own. The seeded overlap can also push a chunk past
/// the bound.
pub fn pack_sentences(sentences: &[String], config: ChunkingConfig) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for (position, sentence) in sentences.iter().enumerate() {
        let sentence_len = sentence.chars().count();
        let joined_len = if current.is_empty() {
            sentence_len
        } else {
            current_len + 1 + sentence_len
        };

        if joined_len <= config.chunk_size {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(sentence);
            current_len = joined_len;
            continue;
        }

        seal(&mut chunks, &current);

        let overlap_start = position.saturating_sub(config.overlap_sentences);
        current = sentences[overlap_start..=position].join(" ");
        current_len = current.chars().count();
    }

    seal(&mut chunks, &current);
    chunks
}

fn seal(chunks: &mut Vec<String>, current: &str) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}
