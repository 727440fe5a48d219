//! Overlapping line-window chunking.

use codelens_store::CodeChunk;
use uuid::Uuid;

use crate::error::{IndexError, Result};
use crate::symbols::extract_symbols;

/// Window geometry, validated on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    chunk_size: usize,
    overlap_size: usize,
}

impl ChunkerConfig {
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidConfig`] if `chunk_size` is zero or
    /// `overlap_size >= chunk_size`.
    pub fn new(chunk_size: usize, overlap_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(IndexError::InvalidConfig(
                "chunk_size must be greater than zero".into(),
            ));
        }
        if overlap_size >= chunk_size {
            return Err(IndexError::InvalidConfig(format!(
                "overlap_size ({overlap_size}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap_size,
        })
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub fn overlap_size(&self) -> usize {
        self.overlap_size
    }

    /// Lines between consecutive window starts. Always at least one.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.chunk_size - self.overlap_size
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 30,
            overlap_size: 10,
        }
    }
}

/// 1-based inclusive line ranges of the windows for a file of `line_count` lines.
#[must_use]
pub fn window_ranges(line_count: usize, config: &ChunkerConfig) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = 1;
    while start <= line_count {
        let end = (start + config.chunk_size - 1).min(line_count);
        ranges.push((start, end));
        if end == line_count {
            break;
        }
        start += config.stride();
    }
    ranges
}

/// Split a file into overlapping line windows.
///
/// Pure function of its inputs: re-chunking identical text yields identical
/// chunk ids.
#[must_use]
pub fn chunk_file(
    repository_id: &str,
    file_path: &str,
    language: &str,
    text: &str,
    config: &ChunkerConfig,
) -> Vec<CodeChunk> {
    let lines: Vec<&str> = text.lines().collect();
    window_ranges(lines.len(), config)
        .into_iter()
        .map(|(start, end)| {
            let content = lines[start - 1..end].join("\n");
            let content_hash = content_hash(&content);
            let start_line = to_line(start);
            CodeChunk {
                id: chunk_id(repository_id, file_path, start_line, &content_hash),
                repository_id: repository_id.to_owned(),
                file_path: file_path.to_owned(),
                language: language.to_owned(),
                start_line,
                end_line: to_line(end),
                symbols: extract_symbols(language, &content),
                content,
                content_hash,
                vector_id: None,
                embedded_at: None,
            }
        })
        .collect()
}

/// Hex blake3 digest of chunk content.
#[must_use]
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// Deterministic chunk id from its location and content.
#[must_use]
pub fn chunk_id(repository_id: &str, file_path: &str, start_line: u32, hash: &str) -> String {
    let name = format!("{repository_id}\0{file_path}\0{start_line}\0{hash}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

fn to_line(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
