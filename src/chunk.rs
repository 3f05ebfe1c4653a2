//! Overlapping fixed-window text chunker.
//!
//! Splits document text into [`Chunk`]s of at most `chunk_size` characters,
//! where consecutive chunks share `overlap` characters. Sizes are counted in
//! Unicode scalar values, so multi-byte text never splits inside a char.
//!
//! # Boundaries
//!
//! With `L` the length of the trimmed text and stride `s = chunk_size - overlap`:
//!
//! - `L == 0` → no chunks.
//! - `L <= chunk_size` → one chunk covering `[0, L)`.
//! - otherwise `N = ceil((L - overlap) / s)` chunks; chunk `k` covers
//!   `[k·s, min(k·s + chunk_size, L))`.
//!
//! The last chunk always ends at `L`, so the chunks cover the whole text
//! with no gaps.
//!
//! ```rust
//! use docgraph::chunk::chunk_text;
//!
//! let chunks = chunk_text("doc", "abcdefghij", 4, 1).unwrap();
//! let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
//! assert_eq!(texts, ["abcd", "defg", "ghij"]);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{DocGraphError, Result};
use crate::models::Chunk;

/// Number of chunks [`chunk_text`] produces for `len` characters.
pub fn expected_chunk_count(len: usize, chunk_size: usize, overlap: usize) -> usize {
    if len == 0 {
        return 0;
    }
    if len <= chunk_size {
        return 1;
    }
    let stride = chunk_size - overlap;
    (len - overlap).div_ceil(stride)
}

/// Split text into overlapping windows.
///
/// Returns an empty vector for empty or whitespace-only text; callers decide
/// whether that is an error.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>> {
    if chunk_size == 0 || overlap >= chunk_size {
        return Err(DocGraphError::InvalidChunking {
            chunk_size,
            overlap,
        });
    }

    let chars: Vec<char> = text.trim().chars().collect();
    let len = chars.len();
    let count = expected_chunk_count(len, chunk_size, overlap);
    let stride = chunk_size - overlap;

    let chunks = (0..count)
        .map(|k| {
            let start = k * stride;
            let end = (start + chunk_size).min(len);
            let piece: String = chars[start..end].iter().collect();
            make_chunk(document_id, k as i64, piece, start, end)
        })
        .collect();

    Ok(chunks)
}

fn make_chunk(document_id: &str, index: i64, text: String, start: usize, end: usize) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text,
        start,
        end,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covers_without_gaps(chunks: &[Chunk], len: usize) -> bool {
        if chunks.is_empty() {
            return len == 0;
        }
        if chunks[0].start != 0 || chunks.last().map(|c| c.end) != Some(len) {
            return false;
        }
        chunks.windows(2).all(|w| w[1].start <= w[0].end)
    }

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 700, 40).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn text_exactly_chunk_size_is_single_chunk() {
        let chunks = chunk_text("doc1", "abcd", 4, 2).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 4));
    }

    #[test]
    fn empty_and_whitespace_produce_no_chunks() {
        assert!(chunk_text("doc1", "", 10, 2).unwrap().is_empty());
        assert!(chunk_text("doc1", "  \n\n\t ", 10, 2).unwrap().is_empty());
    }

    #[test]
    fn rejects_overlap_not_smaller_than_chunk() {
        assert!(matches!(
            chunk_text("doc1", "abc", 4, 4),
            Err(DocGraphError::InvalidChunking { .. })
        ));
        assert!(matches!(
            chunk_text("doc1", "abc", 0, 0),
            Err(DocGraphError::InvalidChunking { .. })
        ));
    }

    #[test]
    fn consecutive_chunks_share_overlap() {
        let chunks = chunk_text("doc1", "abcdefghij", 4, 1).unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["abcd", "defg", "ghij"]);
    }

    #[test]
    fn last_chunk_may_be_short() {
        let chunks = chunk_text("doc1", "abcdefghijk", 4, 1).unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, ["abcd", "defg", "ghij", "jk"]);
    }

    #[test]
    fn count_matches_formula_and_covers_text() {
        let text: String = (0..997).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        for chunk_size in [1usize, 2, 3, 7, 50, 996, 997, 998, 2000] {
            for overlap in [0usize, 1, 3, 6, 49, 995] {
                if overlap >= chunk_size {
                    continue;
                }
                let chunks = chunk_text("doc", &text, chunk_size, overlap).unwrap();
                assert_eq!(
                    chunks.len(),
                    expected_chunk_count(997, chunk_size, overlap),
                    "c={} o={}",
                    chunk_size,
                    overlap
                );
                assert!(covers_without_gaps(&chunks, 997), "c={} o={}", chunk_size, overlap);
                assert!(chunks.iter().all(|c| c.end - c.start <= chunk_size));
            }
        }
    }

    #[test]
    fn expected_count_edge_cases() {
        assert_eq!(expected_chunk_count(0, 10, 2), 0);
        assert_eq!(expected_chunk_count(1, 10, 2), 1);
        assert_eq!(expected_chunk_count(10, 10, 2), 1);
        assert_eq!(expected_chunk_count(11, 10, 2), 2);
        assert_eq!(expected_chunk_count(18, 10, 2), 2);
        assert_eq!(expected_chunk_count(19, 10, 2), 3);
        assert_eq!(expected_chunk_count(100, 10, 0), 10);
    }

    #[test]
    fn multibyte_text_splits_on_chars() {
        let text = "┌──────┐│héllo│└──────┘";
        let chunks = chunk_text("doc1", text, 5, 2).unwrap();
        let len = text.chars().count();
        assert_eq!(chunks.len(), expected_chunk_count(len, 5, 2));
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 5));
    }

    #[test]
    fn indices_are_contiguous_and_hashes_deterministic() {
        let text = "Alpha beta gamma delta epsilon zeta eta theta";
        let c1 = chunk_text("doc1", text, 8, 3).unwrap();
        let c2 = chunk_text("doc1", text, 8, 3).unwrap();
        assert_eq!(c1.len(), c2.len());
        for (i, (a, b)) in c1.iter().zip(c2.iter()).enumerate() {
            assert_eq!(a.chunk_index, i as i64);
            assert_eq!(a.text, b.text);
            assert_eq!(a.hash, b.hash);
        }
    }
}
