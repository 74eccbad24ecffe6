//! Exhaustive inner-product index over fixed-width `f32` vectors.
//!
//! On-disk layout (little endian):
//!
//! ```text
//! magic  [u8; 4]  "RAGX"
//! version u32     currently 1
//! dims    u32
//! count   u64
//! data    f32 * dims * count, ordinal-major
//! ```

use crate::error::SearchError;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use uuid::Uuid;

const INDEX_MAGIC: [u8; 4] = *b"RAGX";
const INDEX_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub ordinal: usize,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimensions: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            data: Vec::new(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.data.len() / self.dimensions
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends vectors in order. Nothing is appended unless every vector has
    /// the index's dimensionality.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), SearchError> {
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != self.dimensions) {
            return Err(SearchError::DimensionMismatch {
                expected: self.dimensions,
                actual: bad.len(),
            });
        }

        self.data.reserve(vectors.len() * self.dimensions);
        for vector in vectors {
            self.data.extend_from_slice(vector);
        }
        Ok(())
    }

    /// Returns up to `k` ordinals by descending inner product with `query`.
    /// Ties keep ordinal order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, SearchError> {
        if query.len() != self.dimensions {
            return Err(SearchError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored = self
            .data
            .chunks_exact(self.dimensions)
            .enumerate()
            .map(|(ordinal, vector)| Neighbor {
                ordinal,
                score: crate::embeddings::inner_product(vector, query),
            })
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| right.score.total_cmp(&left.score));
        scored.truncate(k);
        Ok(scored)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(&INDEX_MAGIC);
        bytes.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dimensions as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for value in &self.data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8], origin: &Path) -> Result<Self, SearchError> {
        let corrupt = |details: String| corrupt_index(origin, details);
        let (dimensions, count) = parse_header(bytes, origin)?;

        let expected_payload = count
            .checked_mul(dimensions)
            .and_then(|values| values.checked_mul(4))
            .ok_or_else(|| corrupt("vector count overflows".to_string()))?;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != expected_payload {
            return Err(corrupt(format!(
                "payload is {} bytes, header promises {expected_payload}",
                payload.len()
            )));
        }

        let data = payload
            .chunks_exact(4)
            .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            .collect();

        Ok(Self { dimensions, data })
    }

    /// Reads an index file; `Ok(None)` when it does not exist yet.
    pub fn read_from(path: &Path) -> Result<Option<Self>, SearchError> {
        match fs::read(path) {
            Ok(bytes) => Self::from_bytes(&bytes, path).map(Some),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Number of vectors in the index file at `path`, read from its header
    /// alone; `Ok(None)` when the file does not exist yet.
    pub fn read_len(path: &Path) -> Result<Option<usize>, SearchError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let mut header = Vec::with_capacity(HEADER_LEN);
        (&mut file).take(HEADER_LEN as u64).read_to_end(&mut header)?;
        let (_, count) = parse_header(&header, path)?;
        Ok(Some(count))
    }

    /// Replaces the file at `path` through a temp file and rename, so readers
    /// never observe a half-written index.
    pub fn write_to(&self, path: &Path) -> Result<(), SearchError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("index.bin");
        let temp_path = path.with_file_name(format!(".{file_name}.tmp-{}", Uuid::new_v4()));

        let written = (|| {
            let mut file = File::create(&temp_path)?;
            file.write_all(&self.to_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, path)
        })();

        if let Err(error) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(error.into());
        }
        Ok(())
    }
}

fn corrupt_index(origin: &Path, details: String) -> SearchError {
    SearchError::CorruptIndex {
        path: origin.display().to_string(),
        details,
    }
}

/// Validates magic and version and returns `(dimensions, count)`.
fn parse_header(bytes: &[u8], origin: &Path) -> Result<(usize, usize), SearchError> {
    if bytes.len() < HEADER_LEN {
        return Err(corrupt_index(
            origin,
            format!("file is {} bytes, shorter than header", bytes.len()),
        ));
    }
    if bytes[0..4] != INDEX_MAGIC {
        return Err(corrupt_index(origin, "bad magic".to_string()));
    }

    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != INDEX_VERSION {
        return Err(corrupt_index(
            origin,
            format!("unsupported format version {version}"),
        ));
    }

    let dimensions = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&bytes[12..HEADER_LEN]);
    let count = usize::try_from(u64::from_le_bytes(count_bytes))
        .map_err(|_| corrupt_index(origin, "vector count overflows".to_string()))?;

    Ok((dimensions, count))
}
