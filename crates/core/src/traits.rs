use crate::{ChunkRecord, SearchError, SearchResult};
use async_trait::async_trait;

#[async_trait]
pub trait VectorStore {
    async fn vector_count(&self, namespace: &str) -> Result<usize, SearchError>;

    async fn append(
        &self,
        namespace: &str,
        vectors: &[Vec<f32>],
        records: &[ChunkRecord],
    ) -> Result<usize, SearchError>;

    async fn nearest(
        &self,
        namespace: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchResult>, SearchError>;
}

/// Answers a question from retrieved context.
///
/// Implementations return [`crate::generator::UNKNOWN_ANSWER`] instead of an
/// error when `context` is empty.
#[async_trait]
pub trait AnswerGenerator {
    async fn generate(&self, question: &str, context: &str) -> Result<String, SearchError>;
}

#[async_trait]
impl<T> AnswerGenerator for Box<T>
where
    T: AnswerGenerator + Send + Sync + ?Sized,
{
    async fn generate(&self, question: &str, context: &str) -> Result<String, SearchError> {
        (**self).generate(question, context).await
    }
}
