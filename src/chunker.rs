use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Bumped whenever the chunking algorithm itself changes shape; baked into
/// `chunk_id` so a chunker upgrade never aliases against stale records.
pub const CHUNKER_VERSION: u32 = 1;

/// Null-byte density / invalid-UTF-8 probe window, matching the convention
/// gitignore-aware walkers use to skip binary blobs.
const BINARY_SNIFF_WINDOW: usize = 8192;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("file unreadable: {0}")]
    Unreadable(String),
    #[error("binary file")]
    Binary,
    #[error("file exceeds max size ({size} > {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("file produced no chunks")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub file_hash: String,
    pub chunk_index: usize,
    pub byte_start: usize,
    pub byte_end: usize,
    pub line_start: usize,
    pub line_end: usize,
    pub text: String,
    pub language: Option<String>,
}

/// Returns true if the first `BINARY_SNIFF_WINDOW` bytes look like binary
/// content: either they contain a NUL byte or they are not valid UTF-8.
pub fn looks_binary(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(BINARY_SNIFF_WINDOW)];
    if window.contains(&0u8) {
        return true;
    }
    std::str::from_utf8(window).is_err()
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn chunk_id_for(file_hash: &str, chunk_index: usize, chunker_version: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_hash.as_bytes());
    hasher.update(chunk_index.to_le_bytes());
    hasher.update(chunker_version.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fixed-size overlapping chunker. `chunk_size_chars` is the target span
/// size S and `chunk_overlap_chars` the overlap O (O must be < S/2).
/// Deterministic for a given `(content, chunker_version, S, O)`: every byte
/// of `content` appears in at least one chunk, and adjacent chunks overlap
/// by exactly O characters (except possibly the final chunk, which may be
/// shorter than S).
pub fn chunk_text(
    content: &str,
    file_hash: &str,
    chunk_size_chars: usize,
    chunk_overlap_chars: usize,
    language: Option<&str>,
) -> Vec<Chunk> {
    if content.is_empty() {
        return Vec::new();
    }
    let overlap = chunk_overlap_chars.min(chunk_size_chars.saturating_sub(1) / 2);
    let stride = chunk_size_chars - overlap;

    // Work over a char-indexed view so byte offsets stay valid on
    // multi-byte UTF-8 boundaries.
    let char_indices: Vec<(usize, char)> = content.char_indices().collect();
    let total_chars = char_indices.len();

    let mut chunks = Vec::new();
    let mut chunk_index = 0usize;
    let mut start_char = 0usize;

    loop {
        let end_char = (start_char + chunk_size_chars).min(total_chars);
        let byte_start = char_indices[start_char].0;
        let byte_end = if end_char < total_chars {
            char_indices[end_char].0
        } else {
            content.len()
        };
        let text = content[byte_start..byte_end].to_string();

        let line_start = content[..byte_start].matches('\n').count() + 1;
        let line_end = line_start + text.matches('\n').count();

        chunks.push(Chunk {
            chunk_id: chunk_id_for(file_hash, chunk_index, CHUNKER_VERSION),
            file_hash: file_hash.to_string(),
            chunk_index,
            byte_start,
            byte_end,
            line_start,
            line_end,
            text,
            language: language.map(|s| s.to_string()),
        });

        if end_char >= total_chars {
            break;
        }
        chunk_index += 1;
        start_char += stride;
    }

    chunks
}

/// Reads a file from disk, validates it against binary/size rules and
/// returns its content hash alongside the derived chunk sequence.
pub fn chunk_file(
    path: &Path,
    max_file_size: u64,
    chunk_size_chars: usize,
    chunk_overlap_chars: usize,
    language: Option<&str>,
) -> Result<(String, Vec<Chunk>), ChunkError> {
    let metadata = std::fs::metadata(path).map_err(|e| ChunkError::Unreadable(e.to_string()))?;
    if metadata.len() > max_file_size {
        return Err(ChunkError::TooLarge { size: metadata.len(), max: max_file_size });
    }

    let bytes = std::fs::read(path).map_err(|e| ChunkError::Unreadable(e.to_string()))?;
    if looks_binary(&bytes) {
        return Err(ChunkError::Binary);
    }

    let content = String::from_utf8(bytes).map_err(|_| ChunkError::Binary)?;
    let file_hash = hash_bytes(content.as_bytes());
    let chunks = chunk_text(&content, &file_hash, chunk_size_chars, chunk_overlap_chars, language);
    if chunks.is_empty() {
        return Err(ChunkError::Empty);
    }
    Ok((file_hash, chunks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_text_basic() {
        let content = "a".repeat(250);
        let hash = hash_bytes(content.as_bytes());
        let chunks = chunk_text(&content, &hash, 100, 20, None);
        assert!(chunks.len() > 1);
        // every byte covered
        let covered_end = chunks.last().unwrap().byte_end;
        assert_eq!(covered_end, content.len());
        // overlap is exact between consecutive chunks
        for pair in chunks.windows(2) {
            let overlap = pair[0].byte_end - pair[1].byte_start;
            assert_eq!(overlap, 20);
        }
    }

    #[test]
    fn test_chunk_text_empty() {
        let chunks = chunk_text("", "deadbeef", 100, 20, None);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_chunk_text_small() {
        let content = "hello world";
        let hash = hash_bytes(content.as_bytes());
        let chunks = chunk_text(content, &hash, 100, 20, Some("rust"));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, content);
        assert_eq!(chunks[0].language.as_deref(), Some("rust"));
    }

    #[test]
    fn test_chunk_text_deterministic() {
        let content = "line one\nline two\nline three\n".repeat(50);
        let hash = hash_bytes(content.as_bytes());
        let a = chunk_text(&content, &hash, 200, 40, None);
        let b = chunk_text(&content, &hash, 200, 40, None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_chunk_id_stable_across_language() {
        let content = "fn main() {}";
        let hash = hash_bytes(content.as_bytes());
        let a = chunk_text(content, &hash, 100, 10, Some("rust"));
        let b = chunk_text(content, &hash, 100, 10, None);
        assert_eq!(a[0].chunk_id, b[0].chunk_id);
    }

    #[test]
    fn test_looks_binary_detects_nul() {
        assert!(looks_binary(b"abc\0def"));
        assert!(!looks_binary(b"plain text"));
    }

    #[test]
    fn test_line_numbers() {
        let content = "one\ntwo\nthree\nfour\nfive\n";
        let hash = hash_bytes(content.as_bytes());
        let chunks = chunk_text(content, &hash, 1000, 0, None);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].line_start, 1);
    }
}
