//! Document Chunking
//!
//! Splits documents into overlapping fixed-size windows for embedding and
//! retrieval. Windows are measured in characters (Unicode scalar values).
//! A window may end early on a natural boundary, but the next window always
//! starts exactly `chunk_overlap` characters before the previous end.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::loader::Document;

/// Default window size in characters
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default overlap between consecutive windows in characters
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

/// Natural boundaries, strongest first. Sentence ends share one tier.
const BOUNDARY_TIERS: &[&[&str]] = &[
    &["\n\n"],
    &["\n"],
    &[". ", "? ", "! "],
    &[" ", "\t"],
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChunkerError {
    #[error("Invalid chunker config: {0}")]
    InvalidConfig(String),
    #[error("No documents to chunk")]
    NoDocuments,
}

/// Window parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Pull window ends back to paragraph/sentence/word breaks when possible
    pub respect_boundaries: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            respect_boundaries: true,
        }
    }
}

impl ChunkerConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, ChunkerError> {
        let config = Self {
            chunk_size,
            chunk_overlap,
            respect_boundaries: true,
        };
        config.validate()?;
        Ok(config)
    }

    /// Hard character cuts only.
    pub fn hard_cuts(mut self) -> Self {
        self.respect_boundaries = false;
        self
    }

    pub fn validate(&self) -> Result<(), ChunkerError> {
        if self.chunk_size == 0 {
            return Err(ChunkerError::InvalidConfig(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ChunkerError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    /// Distance between consecutive window starts
    pub fn step(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }
}

/// A chunk of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Source document identity (path)
    pub source: String,
    /// Chunk index within document
    pub index: u32,
    /// Content of the chunk
    pub content: String,
    /// Start position in document text (chars)
    pub start_pos: usize,
    /// End position in document text (chars, exclusive)
    pub end_pos: usize,
    /// Namespace the chunk was ingested into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.end_pos - self.start_pos
    }
}

/// Chunk every document in order. Blank documents are skipped.
pub fn chunk_documents(
    documents: &[Document],
    config: &ChunkerConfig,
) -> Result<Vec<Chunk>, ChunkerError> {
    config.validate()?;
    if documents.is_empty() {
        return Err(ChunkerError::NoDocuments);
    }

    let mut chunks = Vec::new();
    for doc in documents {
        if doc.is_blank() {
            warn!(source = %doc.source, "Skipping empty document");
            continue;
        }
        let doc_chunks = chunk_text(&doc.source, &doc.text(), config);
        debug!(source = %doc.source, chunks = doc_chunks.len(), "Chunked document");
        chunks.extend(doc_chunks);
    }
    Ok(chunks)
}

/// Slide a window over `text`. Expects a validated config.
pub fn chunk_text(source: &str, text: &str, config: &ChunkerConfig) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let byte_at: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = chars.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0u32;

    loop {
        let hard_end = (start + config.chunk_size).min(total);
        let end = if hard_end < total && config.respect_boundaries {
            find_boundary(&chars, start, hard_end, config).unwrap_or(hard_end)
        } else {
            hard_end
        };

        chunks.push(Chunk {
            source: source.to_string(),
            index,
            content: text[byte_at[start]..byte_at[end]].to_string(),
            start_pos: start,
            end_pos: end,
            namespace: None,
        });

        if end >= total {
            break;
        }
        // end > start + overlap, so this always advances
        start = end - config.chunk_overlap;
        index += 1;
    }

    chunks
}

/// Find the latest natural boundary in the second half of the window.
///
/// Returns a char position just past the separator. Only positions that leave
/// more than `chunk_overlap` characters in the window qualify, so the next
/// window still starts after this one.
fn find_boundary(
    chars: &[char],
    start: usize,
    hard_end: usize,
    config: &ChunkerConfig,
) -> Option<usize> {
    let lowest = start + (config.chunk_overlap + 1).max(config.chunk_size / 2);
    if lowest > hard_end {
        return None;
    }

    for tier in BOUNDARY_TIERS {
        for pos in (lowest..=hard_end).rev() {
            if tier.iter().any(|sep| ends_with_at(chars, pos, sep)) {
                return Some(pos);
            }
        }
    }
    None
}

/// True when `chars[..pos]` ends with `sep`.
fn ends_with_at(chars: &[char], pos: usize, sep: &str) -> bool {
    let sep_len = sep.chars().count();
    if pos < sep_len {
        return false;
    }
    chars[pos - sep_len..pos].iter().copied().eq(sep.chars())
}

/// Number of chunks produced by hard cuts over `total_chars` characters.
pub fn expected_hard_cut_count(total_chars: usize, config: &ChunkerConfig) -> usize {
    if total_chars == 0 {
        0
    } else if total_chars <= config.chunk_size {
        1
    } else {
        (total_chars - config.chunk_overlap).div_ceil(config.step())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prose(paragraphs: usize) -> String {
        (0..paragraphs)
            .map(|i| {
                format!(
                    "Section {i}. The insurer shall pay reasonable and customary charges for \
                     in-patient hospitalisation. Pre-existing diseases are covered after \
                     thirty six months of continuous coverage. Claims must be intimated \
                     within seven days of admission."
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn assert_overlap(chunks: &[Chunk], overlap: usize) {
        for pair in chunks.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert_eq!(b.start_pos, a.end_pos - overlap);
            let tail: String = a.content.chars().skip(a.char_len() - overlap).collect();
            let head: String = b.content.chars().take(overlap).collect();
            assert_eq!(tail, head);
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(ChunkerConfig::new(0, 0).is_err());
        assert!(ChunkerConfig::new(100, 100).is_err());
        assert!(ChunkerConfig::new(100, 99).is_ok());
        assert!(ChunkerConfig::new(100, 0).is_ok());
    }

    #[test]
    fn test_short_document_single_chunk() {
        let config = ChunkerConfig::default();
        let chunks = chunk_text("a.txt", "Short policy text.", &config);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "Short policy text.");
        assert_eq!(chunks[0].start_pos, 0);
        assert_eq!(chunks[0].end_pos, 18);
    }

    #[test]
    fn test_empty_document_skipped() {
        let config = ChunkerConfig::default();
        let docs = vec![
            Document::from_text("empty.txt", ""),
            Document::from_text("blank.txt", "   \n\n  "),
            Document::from_text("real.txt", "Real content."),
        ];
        let chunks = chunk_documents(&docs, &config).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source, "real.txt");
    }

    #[test]
    fn test_no_documents_is_error() {
        let err = chunk_documents(&[], &ChunkerConfig::default()).unwrap_err();
        assert_eq!(err, ChunkerError::NoDocuments);
    }

    #[test]
    fn test_hard_cut_count_matches_formula() {
        let config = ChunkerConfig::new(1000, 100).unwrap().hard_cuts();
        for total in [1usize, 999, 1000, 1001, 1900, 1901, 2500, 2800, 10_000] {
            let text = "x".repeat(total);
            let chunks = chunk_text("doc", &text, &config);
            assert_eq!(
                chunks.len(),
                expected_hard_cut_count(total, &config),
                "total={total}"
            );
            assert!(chunks.iter().all(|c| c.char_len() <= 1000));
            assert_overlap(&chunks, 100);
        }
    }

    #[test]
    fn test_overlap_invariant_with_boundaries() {
        let config = ChunkerConfig::new(300, 40).unwrap();
        let text = prose(12);
        let chunks = chunk_text("policy.txt", &text, &config);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.char_len() <= 300));
        assert_overlap(&chunks, 40);
        assert_eq!(chunks.last().unwrap().end_pos, text.chars().count());
    }

    #[test]
    fn test_prefers_natural_boundaries() {
        let config = ChunkerConfig::new(300, 40).unwrap();
        let text = prose(12);
        let chunks = chunk_text("policy.txt", &text, &config);

        // Every non-final window should end on a sentence or word break
        for chunk in &chunks[..chunks.len() - 1] {
            let last = chunk.content.chars().last().unwrap();
            assert!(last.is_whitespace(), "chunk ended mid-word: {:?}", chunk.content);
        }
    }

    #[test]
    fn test_deterministic() {
        let config = ChunkerConfig::new(250, 25).unwrap();
        let text = prose(8);
        let first = chunk_text("p", &text, &config);
        let second = chunk_text("p", &text, &config);
        assert_eq!(first, second);
    }

    #[test]
    fn test_multibyte_text_is_not_split_mid_char() {
        let config = ChunkerConfig::new(10, 3).unwrap().hard_cuts();
        let text = "₹₹₹₹₹ é clause ünïcode ₹50,000 limit";
        let chunks = chunk_text("u", text, &config);
        assert!(chunks.len() > 1);
        assert_overlap(&chunks, 3);
        let rebuilt: String = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                if i == 0 {
                    c.content.clone()
                } else {
                    c.content.chars().skip(3).collect()
                }
            })
            .collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_pages_joined_before_chunking() {
        let config = ChunkerConfig::new(1000, 100).unwrap();
        let doc = Document::new("p.pdf", vec!["page one".into(), "page two".into()]);
        let chunks = chunk_documents(&[doc], &config).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "page one\n\npage two");
    }
}
