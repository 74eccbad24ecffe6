use crate::embeddings::Embedder;
use crate::traits::VectorStore;
use crate::{RetrievalOptions, SearchError, SearchResult};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Intersection over union of lowercase whitespace-separated word sets.
/// Two texts without any words have similarity 0.
pub fn jaccard_similarity(left: &str, right: &str) -> f64 {
    let left = word_set(left);
    let right = word_set(right);
    jaccard_of_sets(&left, &right)
}

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

fn jaccard_of_sets(left: &HashSet<String>, right: &HashSet<String>) -> f64 {
    let union = left.union(right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(right).count() as f64 / union as f64
}

/// Keeps candidates in their given order, dropping any whose text is more
/// than `threshold` similar to a candidate already kept.
pub fn deduplicate_results(results: Vec<SearchResult>, threshold: f64) -> Vec<SearchResult> {
    let mut accepted_words: Vec<HashSet<String>> = Vec::new();
    let mut deduped = Vec::with_capacity(results.len());

    for result in results {
        let words = word_set(&result.metadata.text);
        let is_duplicate = accepted_words
            .iter()
            .any(|seen| jaccard_of_sets(&words, seen) > threshold);

        if is_duplicate {
            debug!(score = result.score, chunk_id = %result.metadata.chunk_id, "skipped near-duplicate result");
            continue;
        }

        accepted_words.push(words);
        deduped.push(result);
    }

    deduped
}

pub struct RetrievalEngine<S, E>
where
    S: VectorStore,
    E: Embedder,
{
    store: S,
    embedder: E,
    options: RetrievalOptions,
}

impl<S, E> RetrievalEngine<S, E>
where
    S: VectorStore + Send + Sync,
    E: Embedder + Send + Sync,
{
    pub fn new(store: S, embedder: E) -> Self {
        Self::with_options(store, embedder, RetrievalOptions::default())
    }

    pub fn with_options(store: S, embedder: E, options: RetrievalOptions) -> Self {
        Self {
            store,
            embedder,
            options,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    /// Top `top_k` chunks for `query`, highest score first, with
    /// near-duplicates removed.
    ///
    /// An empty namespace short-circuits to no results before the query is
    /// embedded.
    pub async fn retrieve(
        &self,
        namespace: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let total = self.store.vector_count(namespace).await?;
        if total == 0 {
            warn!(namespace, "index is empty, no documents have been ingested yet");
            return Ok(Vec::new());
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed(query);
        let fetch = top_k
            .saturating_mul(self.options.overfetch_factor.max(1))
            .min(total);

        let mut candidates = self.store.nearest(namespace, &query_vector, fetch).await?;
        candidates.sort_by(|left, right| right.score.total_cmp(&left.score));
        let raw_count = candidates.len();

        let mut results = deduplicate_results(candidates, self.options.dedup_threshold);
        results.truncate(top_k);

        info!(
            namespace,
            requested = top_k,
            fetched = raw_count,
            returned = results.len(),
            "retrieval complete"
        );
        Ok(results)
    }
}
