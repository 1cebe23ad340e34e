//! Sliding-window text chunker.
//!
//! Splits a document body into spans of at most `max_chunk_chars` characters,
//! with consecutive full spans overlapping by exactly `overlap_chars`. The
//! final span is excepted: it may be shorter and resumes at the previous
//! span's end, so a 2,500-char document chunked at 1000/100 yields spans of
//! 1000, 1000, and 600 characters.
//!
//! Boundaries depend only on the input text and the configuration, which is
//! what makes reprocessing a document idempotent. All counts are Unicode
//! scalar values, never bytes.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::error::PipelineError;
use crate::models::Chunk;

/// Split `text` into ordered, contiguous-with-overlap chunks.
///
/// Fails with [`PipelineError::InvalidInput`] if the text is empty or the
/// configuration is degenerate (`max_chunk_chars == 0` or
/// `overlap_chars >= max_chunk_chars`).
pub fn chunk_document(
    document_id: &str,
    text: &str,
    config: &ChunkingConfig,
) -> Result<Vec<Chunk>, PipelineError> {
    if text.is_empty() {
        return Err(PipelineError::InvalidInput(
            "document text is empty".to_string(),
        ));
    }
    if config.max_chunk_chars == 0 {
        return Err(PipelineError::InvalidInput(
            "max_chunk_chars must be > 0".to_string(),
        ));
    }
    if config.overlap_chars >= config.max_chunk_chars {
        return Err(PipelineError::InvalidInput(
            "overlap_chars must be < max_chunk_chars".to_string(),
        ));
    }

    let spans = chunk_spans(text.chars().count(), config);

    // Byte offset of every char boundary, so spans in char space can slice
    // the source without landing inside a multi-byte character.
    let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    bounds.push(text.len());

    let chunks = spans
        .iter()
        .enumerate()
        .map(|(index, &(start, end))| {
            let piece = &text[bounds[start]..bounds[end]];
            make_chunk(document_id, index as i64, piece, (end - start) as i64)
        })
        .collect();

    Ok(chunks)
}

/// Compute chunk boundaries as `(start, end)` pairs in char space.
///
/// Invariants: spans cover `0..len` contiguously, each span is at most
/// `max_chunk_chars` long, and every span followed by a full-size span
/// overlaps it by exactly `overlap_chars`. The final span carries no
/// overlap prefix even when the remainder is exactly `max_chunk_chars`
/// long (2000 chars at 1000/100 yields two abutting full spans).
fn chunk_spans(len: usize, config: &ChunkingConfig) -> Vec<(usize, usize)> {
    let max = config.max_chunk_chars;
    let overlap = config.overlap_chars;

    let mut spans = Vec::new();
    let mut start = 0usize;

    loop {
        if len - start <= max {
            spans.push((start, len));
            break;
        }
        let end = start + max;
        spans.push((start, end));
        // The overlap prefix is only carried into another full-size span;
        // a final partial chunk resumes where the previous one ended.
        start = if len - end > max { end - overlap } else { end };
    }

    spans
}

fn make_chunk(document_id: &str, index: i64, text: &str, char_len: i64) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        char_len,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            max_chunk_chars: max,
            overlap_chars: overlap,
        }
    }

    #[test]
    fn test_empty_text_rejected() {
        let err = chunk_document("doc1", "", &cfg(1000, 100)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_document("doc1", "Hello, world!", &cfg(1000, 100)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn test_exact_fit_single_chunk() {
        let text = "a".repeat(1000);
        let chunks = chunk_document("doc1", &text, &cfg(1000, 100)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].char_len, 1000);
    }

    #[test]
    fn test_documented_2500_char_scenario() {
        let text: String = (0..2500).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = chunk_document("doc1", &text, &cfg(1000, 100)).unwrap();

        let lens: Vec<i64> = chunks.iter().map(|c| c.char_len).collect();
        assert_eq!(lens, vec![1000, 1000, 600]);

        // First boundary overlaps by exactly 100 chars
        let tail_of_first: String = chunks[0].text.chars().skip(900).collect();
        let head_of_second: String = chunks[1].text.chars().take(100).collect();
        assert_eq!(tail_of_first, head_of_second);
    }

    #[test]
    fn test_exact_double_length_final_span_abuts_without_overlap() {
        let spans = chunk_spans(2000, &cfg(1000, 100));
        assert_eq!(spans, vec![(0, 1000), (1000, 2000)]);
    }

    #[test]
    fn test_spans_cover_text_without_gaps() {
        for len in [1, 7, 999, 1000, 1001, 1500, 2100, 2500, 10_000] {
            let spans = chunk_spans(len, &cfg(1000, 100));
            assert_eq!(spans[0].0, 0);
            assert_eq!(spans.last().unwrap().1, len);
            for pair in spans.windows(2) {
                assert!(pair[1].0 <= pair[0].1, "gap at {:?} for len {}", pair, len);
                assert!(pair[1].0 > pair[0].0);
            }
            for &(start, end) in &spans {
                assert!(end - start <= 1000);
                assert!(end > start);
            }
        }
    }

    #[test]
    fn test_full_spans_overlap_exactly() {
        let spans = chunk_spans(5000, &cfg(1000, 100));
        for pair in spans.windows(2) {
            let (_, prev_end) = pair[0];
            let (next_start, next_end) = pair[1];
            if next_end - next_start == 1000 {
                assert_eq!(prev_end - next_start, 100);
            }
        }
    }

    #[test]
    fn test_deterministic_boundaries() {
        let text: String = (0..3137).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let a = chunk_document("doc1", &text, &cfg(700, 50)).unwrap();
        let b = chunk_document("doc1", &text, &cfg(700, 50)).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.hash, y.hash);
            assert_eq!(x.chunk_index, y.chunk_index);
        }
    }

    #[test]
    fn test_reconstruction_from_spans() {
        let text: String = (0..4321).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let config = cfg(500, 60);
        let chunks = chunk_document("doc1", &text, &config).unwrap();
        let spans = chunk_spans(text.chars().count(), &config);

        // Drop each chunk's overlap with its predecessor and concatenate
        let mut rebuilt = String::new();
        let mut covered = 0usize;
        for (chunk, &(start, _end)) in chunks.iter().zip(spans.iter()) {
            let skip = covered - start;
            rebuilt.extend(chunk.text.chars().skip(skip));
            covered += chunk.text.chars().count() - skip;
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_multibyte_text_respects_char_boundaries() {
        let text = "héllo wörld — ünïcode ".repeat(60); // > 1000 chars, multibyte
        let chunks = chunk_document("doc1", &text, &cfg(1000, 100)).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.char_len <= 1000);
            assert_eq!(chunk.text.chars().count() as i64, chunk.char_len);
        }
    }
}
