//! Sliding-window chunk assembler.
//!
//! Slides a fixed-size window of `chunk_size` characters over each page's
//! sanitized text with `overlap` characters shared between consecutive
//! windows; the final window on a page may be shorter. Offsets are character
//! offsets into the page text and windows are computed over `char`
//! boundaries, so multi-byte text never splits a code point.
//!
//! Assembly is pure and restartable: the same document and parameters always
//! reproduce identical boundaries, offsets, and indices, which is what makes
//! re-ingestion idempotent.

use uuid::Uuid;

use crate::error::IngestError;
use crate::models::{Chunk, Document, ParsedDocument};

/// Validate chunking parameters. Shared by job submission and assembly so a
/// bad configuration is rejected before any file is touched.
pub fn validate_params(chunk_size: usize, overlap: usize) -> Result<(), IngestError> {
    if chunk_size == 0 {
        return Err(IngestError::InvalidConfig(
            "chunk size must be positive".to_string(),
        ));
    }
    if overlap >= chunk_size {
        return Err(IngestError::InvalidConfig(format!(
            "chunk overlap ({}) must be smaller than chunk size ({})",
            overlap, chunk_size
        )));
    }
    Ok(())
}

/// Window one page's text. Returns (content, char_start, char_end) per
/// window, end exclusive. Empty text yields no windows.
fn slice_page(text: &str, chunk_size: usize, overlap: usize) -> Vec<(String, usize, usize)> {
    // Byte offset of each char, so windows can slice without re-scanning.
    let boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let total = boundaries.len();
    if total == 0 {
        return Vec::new();
    }

    let mut windows = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + chunk_size).min(total);
        let byte_start = boundaries[start];
        let byte_end = if end == total {
            text.len()
        } else {
            boundaries[end]
        };
        windows.push((text[byte_start..byte_end].to_string(), start, end));
        if end == total {
            break;
        }
        start = end - overlap;
    }
    windows
}

/// Assemble the ordered chunk sequence for one document. Page-local indices
/// restart per page; the global index increases across the whole document in
/// page order then window order and is never reassigned.
pub fn assemble(
    parsed: &ParsedDocument,
    document: &Document,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, IngestError> {
    validate_params(chunk_size, overlap)?;

    let base_metadata = serde_json::json!({
        "document_title": document.title,
        "source_path": document.source_path,
        "collection": document.collection,
        "job_id": document.job_id,
        "content_hash": document.content_hash,
    });

    let mut chunks = Vec::new();
    let mut chunk_index: i64 = 0;
    for page in &parsed.pages {
        let windows = slice_page(&page.text, chunk_size, overlap);
        for (page_index, (content, start, end)) in windows.into_iter().enumerate() {
            let mut metadata = base_metadata.clone();
            if let Some(map) = metadata.as_object_mut() {
                map.insert("page_number".to_string(), serde_json::Value::from(page.number));
                map.insert(
                    "page_metadata".to_string(),
                    serde_json::Value::Object(page.metadata.clone()),
                );
            }
            chunks.push(Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: document.id.clone(),
                page_number: page.number,
                page_index: page_index as i64,
                chunk_index,
                char_start: start as i64,
                char_end: end as i64,
                content,
                metadata,
                embedding: None,
                embedding_model: None,
                citation: None,
            });
            chunk_index += 1;
        }
    }

    let total = chunks.len();
    for chunk in &mut chunks {
        if let Some(map) = chunk.metadata.as_object_mut() {
            map.insert("chunk_total".to_string(), serde_json::Value::from(total));
        }
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParsedPage;

    fn doc() -> Document {
        Document {
            id: "doc-1".to_string(),
            title: "Test".to_string(),
            source_path: "/tmp/test.txt".to_string(),
            collection: "default".to_string(),
            job_id: "job-1".to_string(),
            content_hash: "abc".to_string(),
            page_count: 1,
            metadata: serde_json::json!({}),
            created_at: 0,
        }
    }

    fn parsed(pages: Vec<(i64, String)>) -> ParsedDocument {
        ParsedDocument {
            title: "Test".to_string(),
            pages: pages
                .into_iter()
                .map(|(number, text)| ParsedPage {
                    number,
                    text,
                    metadata: serde_json::Map::new(),
                    render: None,
                })
                .collect(),
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_two_windows_over_2000_chars() {
        // chunk_size=1200, overlap=150, 2000 chars -> [0,1200) and [1050,2000)
        let text = "x".repeat(2000);
        let chunks = assemble(&parsed(vec![(1, text)]), &doc(), 1200, 150).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].char_start, chunks[0].char_end), (0, 1200));
        assert_eq!((chunks[1].char_start, chunks[1].char_end), (1050, 2000));
        assert_eq!(chunks[0].content.len(), 1200);
        assert_eq!(chunks[1].content.len(), 950);
    }

    #[test]
    fn test_short_page_single_chunk() {
        let chunks = assemble(&parsed(vec![(1, "tiny".to_string())]), &doc(), 1200, 150).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].char_start, chunks[0].char_end), (0, 4));
        assert_eq!(chunks[0].content, "tiny");
    }

    #[test]
    fn test_empty_page_yields_no_chunks() {
        let chunks = assemble(
            &parsed(vec![(1, String::new()), (2, "text".to_string())]),
            &doc(),
            100,
            10,
        )
        .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page_number, 2);
    }

    #[test]
    fn test_overlap_equal_to_size_rejected() {
        let err = assemble(&parsed(vec![(1, "abc".to_string())]), &doc(), 1200, 1200).unwrap_err();
        assert!(matches!(err, IngestError::InvalidConfig(_)));
        assert!(validate_params(0, 0).is_err());
        assert!(validate_params(10, 3).is_ok());
    }

    #[test]
    fn test_indices_per_page_and_global() {
        let page_text = "a".repeat(25);
        let chunks = assemble(
            &parsed(vec![(1, page_text.clone()), (2, page_text)]),
            &doc(),
            10,
            2,
        )
        .unwrap();
        // 25 chars, size 10, overlap 2: [0,10) [8,18) [16,25) -> 3 per page
        assert_eq!(chunks.len(), 6);
        let page_indices: Vec<i64> = chunks.iter().map(|c| c.page_index).collect();
        assert_eq!(page_indices, vec![0, 1, 2, 0, 1, 2]);
        let global: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(global, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(chunks[3].page_number, 2);
        assert_eq!((chunks[2].char_start, chunks[2].char_end), (16, 25));
    }

    #[test]
    fn test_deterministic_reassembly() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        let d = parsed(vec![(1, text)]);
        let a = assemble(&d, &doc(), 120, 30).unwrap();
        let b = assemble(&d, &doc(), 120, 30).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.content, y.content);
            assert_eq!(x.char_start, y.char_start);
            assert_eq!(x.char_end, y.char_end);
            assert_eq!(x.chunk_index, y.chunk_index);
            assert_eq!(x.page_index, y.page_index);
        }
    }

    #[test]
    fn test_multibyte_text_offsets_in_chars() {
        let text = "é".repeat(10);
        let chunks = assemble(&parsed(vec![(1, text)]), &doc(), 4, 1).unwrap();
        let spans: Vec<(i64, i64)> = chunks.iter().map(|c| (c.char_start, c.char_end)).collect();
        assert_eq!(spans, vec![(0, 4), (3, 7), (6, 10)]);
        assert_eq!(chunks[0].content.chars().count(), 4);
        assert_eq!(chunks[2].content.chars().count(), 4);
    }

    #[test]
    fn test_zero_overlap_tiles_exactly() {
        let text = "a".repeat(30);
        let chunks = assemble(&parsed(vec![(1, text)]), &doc(), 10, 0).unwrap();
        let spans: Vec<(i64, i64)> = chunks.iter().map(|c| (c.char_start, c.char_end)).collect();
        assert_eq!(spans, vec![(0, 10), (10, 20), (20, 30)]);
    }

    #[test]
    fn test_chunk_metadata_carries_provenance() {
        let chunks = assemble(&parsed(vec![(1, "hello world".to_string())]), &doc(), 5, 1).unwrap();
        let meta = chunks[0].metadata.as_object().unwrap();
        assert_eq!(meta["collection"], "default");
        assert_eq!(meta["job_id"], "job-1");
        assert_eq!(meta["content_hash"], "abc");
        assert_eq!(meta["page_number"], 1);
        assert_eq!(meta["chunk_total"], serde_json::json!(chunks.len()));
    }
}
