use crate::embeddings::normalize_l2;
use crate::index::FlatIndex;
use crate::traits::VectorStore;
use crate::{ChunkRecord, SearchError, SearchResult};
use async_trait::async_trait;
use fs2::FileExt;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.bin";
const METADATA_FILE: &str = "metadata.jsonl";
const LOCK_FILE: &str = ".lock";
const PLACEHOLDER_LINE: &[u8] = b"{}\n";
const MAX_NAMESPACE_LEN: usize = 64;

/// Namespaced vector index plus its order-aligned metadata log.
///
/// Each namespace lives in `{root}/{namespace}/` as `index.bin` and
/// `metadata.jsonl`, where log line `i` describes index ordinal `i`. Writers
/// to one namespace are serialized by an in-process mutex and an exclusive
/// `fs2` lock on `.lock`; searches take a shared lock and may run in parallel.
///
/// Clones share the in-process writer locks. The [`VectorStore`] impl runs
/// every file and lock operation on the blocking thread pool.
#[derive(Clone)]
pub struct IndexStore {
    root: PathBuf,
    dimensions: usize,
    writers: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl IndexStore {
    pub fn open(root: impl Into<PathBuf>, dimensions: usize) -> Self {
        Self {
            root: root.into(),
            dimensions,
            writers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, SearchError> {
        validate_namespace(namespace)?;
        Ok(self.root.join(namespace))
    }

    /// Returns the committed index for `namespace`, or an empty one of
    /// dimensionality `dimensions` if nothing has been written yet.
    pub fn load(&self, namespace: &str, dimensions: usize) -> Result<FlatIndex, SearchError> {
        let dir = self.namespace_dir(namespace)?;
        let _lock = acquire_shared_lock(&dir)?;
        load_committed(&dir, dimensions)
    }

    pub fn count(&self, namespace: &str) -> Result<usize, SearchError> {
        let dir = self.namespace_dir(namespace)?;
        let _lock = acquire_shared_lock(&dir)?;
        Ok(FlatIndex::read_len(&dir.join(INDEX_FILE))?.unwrap_or(0))
    }

    /// Namespaces that already hold a committed index, sorted by name.
    pub fn namespaces(&self) -> Result<Vec<String>, SearchError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.path().join(INDEX_FILE).is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_namespace(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    /// Appends `vectors` and their `records` to `namespace` and persists both.
    ///
    /// Vectors are L2-normalized first. Batch entry `i` lands at ordinal
    /// `previous_total + i` and on the log line with the same number. On
    /// return `index` holds the newly committed state, which also picks up
    /// anything other writers committed since it was loaded.
    pub fn add(
        &self,
        namespace: &str,
        index: &mut FlatIndex,
        vectors: &[Vec<f32>],
        records: &[ChunkRecord],
    ) -> Result<usize, SearchError> {
        if vectors.len() != records.len() {
            return Err(SearchError::Request(format!(
                "embedding count {} doesn't match record count {}",
                vectors.len(),
                records.len()
            )));
        }
        if let Some(bad) = vectors
            .iter()
            .find(|vector| vector.len() != index.dimensions())
        {
            return Err(SearchError::DimensionMismatch {
                expected: index.dimensions(),
                actual: bad.len(),
            });
        }

        let dir = self.namespace_dir(namespace)?;
        if vectors.is_empty() {
            return Ok(index.len());
        }

        let normalized = vectors
            .iter()
            .map(|vector| {
                let mut vector = vector.clone();
                normalize_l2(&mut vector);
                vector
            })
            .collect::<Vec<_>>();

        let mut lines = Vec::new();
        for record in records {
            serde_json::to_writer(&mut lines, record)?;
            lines.push(b'\n');
        }

        let writer = self.writer_for(namespace);
        let _guard = writer.lock().unwrap_or_else(PoisonError::into_inner);

        fs::create_dir_all(&dir)?;
        let lock_file = File::create(dir.join(LOCK_FILE))?;
        lock_file.lock_exclusive()?;

        let mut committed = load_committed(&dir, index.dimensions())?;
        let previous_total = committed.len();

        let mut log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(METADATA_FILE))?;
        let append_at = align_log(&mut log, previous_total, namespace)?;

        log.seek(SeekFrom::Start(append_at))?;
        log.write_all(&lines)?;
        log.sync_data()?;

        committed.add(&normalized)?;
        if let Err(error) = committed.write_to(&dir.join(INDEX_FILE)) {
            warn!(namespace, %error, "index commit failed, rolling back metadata log");
            log.set_len(append_at)?;
            return Err(error);
        }

        let _ = lock_file.unlock();

        info!(
            namespace,
            added = vectors.len(),
            total = committed.len(),
            "vectors appended"
        );
        *index = committed;
        Ok(index.len())
    }

    /// Nearest neighbours of `query` in `index`, resolved to metadata records.
    ///
    /// Ordinals with no readable log line resolve to `ChunkRecord::default()`.
    pub fn search(
        &self,
        namespace: &str,
        index: &FlatIndex,
        query: &[f32],
        top_k: usize,
    ) -> Result<(Vec<f32>, Vec<ChunkRecord>), SearchError> {
        let dir = self.namespace_dir(namespace)?;
        if index.is_empty() || top_k == 0 {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut query = query.to_vec();
        normalize_l2(&mut query);

        let neighbors = index.search(&query, top_k.min(index.len()))?;
        let ordinals = neighbors
            .iter()
            .map(|neighbor| neighbor.ordinal)
            .collect::<Vec<_>>();

        let _lock = acquire_shared_lock(&dir)?;
        let mut resolved = read_records(&dir.join(METADATA_FILE), &ordinals, namespace)?;

        let scores = neighbors.iter().map(|neighbor| neighbor.score).collect();
        let records = ordinals
            .iter()
            .map(|ordinal| resolved.remove(ordinal).unwrap_or_default())
            .collect();

        debug!(namespace, hits = ordinals.len(), "index searched");
        Ok((scores, records))
    }

    fn writer_for(&self, namespace: &str) -> Arc<Mutex<()>> {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        writers
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl VectorStore for IndexStore {
    async fn vector_count(&self, namespace: &str) -> Result<usize, SearchError> {
        let store = self.clone();
        let namespace = namespace.to_string();
        tokio::task::spawn_blocking(move || store.count(&namespace)).await?
    }

    async fn append(
        &self,
        namespace: &str,
        vectors: &[Vec<f32>],
        records: &[ChunkRecord],
    ) -> Result<usize, SearchError> {
        let store = self.clone();
        let namespace = namespace.to_string();
        let vectors = vectors.to_vec();
        let records = records.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut index = store.load(&namespace, store.dimensions)?;
            store.add(&namespace, &mut index, &vectors, &records)
        })
        .await?
    }

    async fn nearest(
        &self,
        namespace: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let store = self.clone();
        let namespace = namespace.to_string();
        let query_vector = query_vector.to_vec();
        let (scores, records) = tokio::task::spawn_blocking(move || {
            let index = store.load(&namespace, store.dimensions)?;
            store.search(&namespace, &index, &query_vector, top_k)
        })
        .await??;

        Ok(scores
            .into_iter()
            .zip(records)
            .map(|(score, metadata)| SearchResult { score, metadata })
            .collect())
    }
}

fn validate_namespace(namespace: &str) -> Result<(), SearchError> {
    let valid = !namespace.is_empty()
        && namespace.len() <= MAX_NAMESPACE_LEN
        && namespace
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');

    if valid {
        Ok(())
    } else {
        Err(SearchError::InvalidNamespace(namespace.to_string()))
    }
}

fn load_committed(dir: &Path, dimensions: usize) -> Result<FlatIndex, SearchError> {
    match FlatIndex::read_from(&dir.join(INDEX_FILE))? {
        Some(index) if index.dimensions() != dimensions => Err(SearchError::DimensionMismatch {
            expected: index.dimensions(),
            actual: dimensions,
        }),
        Some(index) => Ok(index),
        None => Ok(FlatIndex::new(dimensions)),
    }
}

fn acquire_shared_lock(dir: &Path) -> Result<Option<File>, SearchError> {
    let lock_path = dir.join(LOCK_FILE);
    if !lock_path.exists() {
        return Ok(None);
    }
    let lock_file = File::open(&lock_path)?;
    lock_file.lock_shared()?;
    Ok(Some(lock_file))
}

/// Makes the log hold exactly `committed` complete lines and returns the byte
/// offset just past them.
///
/// Lines beyond the committed index (an append whose index commit never
/// happened) and any unterminated tail are cut off; a log that is short is
/// padded with placeholder lines so new records keep their ordinals.
fn align_log(log: &mut File, committed: usize, namespace: &str) -> Result<u64, SearchError> {
    let mut kept = 0usize;
    let mut offset = 0u64;
    {
        let mut reader = BufReader::new(&*log);
        let mut line = Vec::new();
        while kept < committed {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            kept += 1;
            offset += read as u64;
        }
    }

    let length = log.metadata()?.len();
    if length > offset && kept == committed {
        warn!(
            namespace,
            committed,
            dropped_bytes = length - offset,
            "metadata log ran past the committed index, truncating"
        );
    }
    log.set_len(offset)?;

    if kept < committed {
        let missing = committed - kept;
        warn!(namespace, committed, missing, "metadata log is short, padding with placeholders");
        log.seek(SeekFrom::Start(offset))?;
        for _ in 0..missing {
            log.write_all(PLACEHOLDER_LINE)?;
        }
        offset += (missing * PLACEHOLDER_LINE.len()) as u64;
    }

    Ok(offset)
}

/// Streams the log once and decodes only the lines named in `ordinals`.
fn read_records(
    path: &Path,
    ordinals: &[usize],
    namespace: &str,
) -> Result<BTreeMap<usize, ChunkRecord>, SearchError> {
    let mut wanted = ordinals.iter().copied().collect::<Vec<_>>();
    wanted.sort_unstable();
    wanted.dedup();

    let mut resolved = BTreeMap::new();
    let Some(&last) = wanted.last() else {
        return Ok(resolved);
    };

    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            warn!(namespace, "metadata log missing, using placeholders");
            return Ok(resolved);
        }
        Err(error) => return Err(error.into()),
    };

    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut cursor = wanted.iter().peekable();
    for ordinal in 0..=last {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            warn!(namespace, ordinal, "ordinal beyond metadata log, using placeholder");
            break;
        }
        if cursor.peek() != Some(&&ordinal) {
            continue;
        }
        cursor.next();

        match serde_json::from_slice::<ChunkRecord>(&line) {
            Ok(record) => {
                resolved.insert(ordinal, record);
            }
            Err(error) => {
                warn!(namespace, ordinal, %error, "malformed metadata line, using placeholder");
            }
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RealmTag;
    use tempfile::tempdir;

    fn record(id: &str, text: &str) -> ChunkRecord {
        ChunkRecord {
            chunk_id: id.to_string(),
            source_document: "doc.pdf".to_string(),
            page_number: 1,
            sequence_index: 0,
            text: text.to_string(),
            realm_tag: Some(RealmTag::General),
        }
    }

    fn three_vectors() -> Vec<Vec<f32>> {
        vec![vec![1.0, 0.0, 0.0], vec![0.0, 2.0, 0.0], vec![0.0, 0.0, 3.0]]
    }

    #[test]
    fn add_then_search_finds_the_matching_record() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::open(dir.path(), 3);
        let mut index = store.load("default", 3)?;
        let records = vec![record("m1", "one"), record("m2", "two"), record("m3", "three")];

        let total = store.add("default", &mut index, &three_vectors(), &records)?;
        assert_eq!(total, 3);

        let (scores, found) = store.search("default", &index, &[1.0, 0.0, 0.0], 1)?;
        assert_eq!(found, vec![records[0].clone()]);
        assert!((scores[0] - 1.0).abs() < 1e-5);

        let (_, found) = store.search("default", &index, &[0.0, 0.0, 5.0], 1)?;
        assert_eq!(found[0].chunk_id, "m3");
        Ok(())
    }

    #[test]
    fn empty_namespace_searches_to_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::open(dir.path(), 3);
        let index = store.load("fresh", 3)?;

        let (scores, records) = store.search("fresh", &index, &[1.0, 0.0, 0.0], 5)?;

        assert!(scores.is_empty());
        assert!(records.is_empty());
        assert!(!dir.path().join("fresh").exists());
        Ok(())
    }

    #[test]
    fn second_batch_continues_ordinals() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::open(dir.path(), 3);
        let mut index = store.load("default", 3)?;
        let vectors = three_vectors();

        store.add("default", &mut index, &vectors[..2], &[record("a", "a"), record("b", "b")])?;
        store.add("default", &mut index, &vectors[2..], &[record("c", "c")])?;

        let reloaded = store.load("default", 3)?;
        assert_eq!(reloaded.len(), 3);
        let (_, found) = store.search("default", &reloaded, &[0.0, 0.0, 1.0], 1)?;
        assert_eq!(found[0].chunk_id, "c");

        let log = fs::read_to_string(dir.path().join("default").join(METADATA_FILE))?;
        assert_eq!(log.lines().count(), 3);
        Ok(())
    }

    #[test]
    fn stale_handle_does_not_misalign_records() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::open(dir.path(), 3);
        let vectors = three_vectors();
        let mut first = store.load("default", 3)?;
        let mut stale = store.load("default", 3)?;

        store.add("default", &mut first, &vectors[..1], &[record("a", "a")])?;
        store.add("default", &mut stale, &vectors[1..2], &[record("b", "b")])?;

        assert_eq!(stale.len(), 2);
        let (_, found) = store.search("default", &stale, &[0.0, 1.0, 0.0], 1)?;
        assert_eq!(found[0].chunk_id, "b");
        Ok(())
    }

    #[test]
    fn concurrent_writers_keep_index_and_log_aligned() -> Result<(), Box<dyn std::error::Error>> {
        const WRITERS: usize = 8;
        const APPENDS: usize = 20;
        const DIMS: usize = 4;

        let dir = tempdir()?;
        std::thread::scope(|scope| {
            let handles = (0..WRITERS)
                .map(|writer| {
                    let root = dir.path().to_path_buf();
                    scope.spawn(move || -> Result<(), SearchError> {
                        let store = IndexStore::open(root, DIMS);
                        for append in 0..APPENDS {
                            let slot = (writer + append) % DIMS;
                            let mut vector = vec![0.0; DIMS];
                            vector[slot] = 1.0;
                            let mut index = store.load("shared", DIMS)?;
                            store.add(
                                "shared",
                                &mut index,
                                &[vector],
                                &[record(&format!("w{writer}-{append}"), &slot.to_string())],
                            )?;
                        }
                        Ok(())
                    })
                })
                .collect::<Vec<_>>();

            for handle in handles {
                handle
                    .join()
                    .expect("writer thread panicked")
                    .expect("append succeeds");
            }
        });

        let store = IndexStore::open(dir.path(), DIMS);
        let index = FlatIndex::read_from(&dir.path().join("shared").join(INDEX_FILE))?
            .ok_or("index should exist")?;
        let log = fs::read_to_string(dir.path().join("shared").join(METADATA_FILE))?;
        let records = log
            .lines()
            .map(|line| serde_json::from_str::<ChunkRecord>(line))
            .collect::<Result<Vec<_>, _>>()?;

        assert_eq!(index.len(), WRITERS * APPENDS);
        assert_eq!(records.len(), index.len());
        assert_eq!(store.count("shared")?, index.len());

        let mut ids = records
            .iter()
            .map(|record| record.chunk_id.clone())
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), WRITERS * APPENDS);

        let peaks = index.to_bytes()[20..]
            .chunks_exact(4 * DIMS)
            .map(|vector| {
                vector
                    .chunks_exact(4)
                    .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
                    .enumerate()
                    .max_by(|left, right| left.1.total_cmp(&right.1))
                    .map(|(slot, _)| slot.to_string())
            })
            .collect::<Vec<_>>();
        for (ordinal, record) in records.iter().enumerate() {
            assert_eq!(peaks[ordinal].as_deref(), Some(record.text.as_str()), "ordinal {ordinal}");
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn vector_store_calls_run_on_blocking_pool() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::open(dir.path(), 3);

        let total = store
            .append("default", &three_vectors(), &[record("a", "a"), record("b", "b"), record("c", "c")])
            .await?;
        assert_eq!(total, 3);
        assert_eq!(store.vector_count("default").await?, 3);

        let hits = store.nearest("default", &[0.0, 1.0, 0.0], 1).await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.chunk_id, "b");
        Ok(())
    }

    #[test]
    fn namespaces_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::open(dir.path(), 3);
        let mut finance = store.load("finance", 3)?;
        store.add("finance", &mut finance, &three_vectors()[..1], &[record("f", "ledger")])?;

        assert_eq!(store.count("finance")?, 1);
        assert_eq!(store.count("medical")?, 0);
        assert_eq!(store.namespaces()?, vec!["finance".to_string()]);
        Ok(())
    }

    #[test]
    fn mismatched_batches_write_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::open(dir.path(), 3);
        let mut index = store.load("default", 3)?;

        assert!(store
            .add("default", &mut index, &three_vectors(), &[record("a", "a")])
            .is_err());
        assert!(matches!(
            store.add("default", &mut index, &[vec![1.0, 0.0]], &[record("a", "a")]),
            Err(SearchError::DimensionMismatch { .. })
        ));
        assert!(!dir.path().join("default").join(METADATA_FILE).exists());
        Ok(())
    }

    #[test]
    fn malformed_and_missing_lines_become_placeholders() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::open(dir.path(), 3);
        let mut index = store.load("default", 3)?;
        let records = vec![record("m1", "one"), record("m2", "two"), record("m3", "three")];
        store.add("default", &mut index, &three_vectors(), &records)?;

        let log_path = dir.path().join("default").join(METADATA_FILE);
        let log = fs::read_to_string(&log_path)?;
        let first = log.lines().next().ok_or("log should have a line")?;
        fs::write(&log_path, format!("{first}\nnot json\n"))?;

        let (scores, found) = store.search("default", &index, &[1.0, 1.0, 1.0], 3)?;

        assert_eq!(scores.len(), 3);
        assert_eq!(found.len(), 3);
        assert_eq!(found.iter().filter(|record| record.is_placeholder()).count(), 2);
        assert!(found.iter().any(|record| record.chunk_id == "m1"));
        Ok(())
    }

    #[test]
    fn orphaned_log_lines_are_dropped_on_next_append() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::open(dir.path(), 3);
        let vectors = three_vectors();
        let mut index = store.load("default", 3)?;
        store.add("default", &mut index, &vectors[..1], &[record("a", "a")])?;

        let log_path = dir.path().join("default").join(METADATA_FILE);
        let mut log = OpenOptions::new().append(true).open(&log_path)?;
        log.write_all(b"{\"chunk_id\":\"orphan\"}\n{\"chunk_id\":\"half")?;
        drop(log);

        store.add("default", &mut index, &vectors[1..2], &[record("b", "b")])?;

        let contents = fs::read_to_string(&log_path)?;
        let ids = contents
            .lines()
            .map(|line| serde_json::from_str::<ChunkRecord>(line))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|record| record.chunk_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        Ok(())
    }

    #[test]
    fn other_dimensionality_on_disk_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = IndexStore::open(dir.path(), 3);
        let mut index = store.load("default", 3)?;
        store.add("default", &mut index, &three_vectors()[..1], &[record("a", "a")])?;

        assert!(matches!(
            store.load("default", 8),
            Err(SearchError::DimensionMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn namespace_names_are_restricted() {
        let store = IndexStore::open("/tmp/unused", 3);
        assert!(store.namespace_dir("finance-2024_q1").is_ok());
        assert!(store.namespace_dir("../escape").is_err());
        assert!(store.namespace_dir("").is_err());
    }
}
