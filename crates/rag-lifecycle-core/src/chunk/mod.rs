//! Multi-strategy text chunker.
//!
//! Splits document text into [`Chunk`]s under one of six policies
//! ([`StrategyKind`]). Every strategy shares the same windowing driver and
//! differs only in where it prefers to cut:
//!
//! | Strategy | Preferred cut |
//! |----------|---------------|
//! | [`SentenceChunker`] | last sentence end in the window |
//! | [`ParagraphChunker`] | last blank line, then sentence end |
//! | [`SemanticChunker`] | sentence end with the largest topic shift |
//! | [`HybridChunker`] | sentence end balancing fill and topic shift |
//! | [`AdaptiveChunker`] | sentence end in a window shrunk for dense text |
//! | [`CitationAwareChunker`] | sentence end that does not split a citation |
//!
//! # Guarantees
//!
//! - No chunk is longer than `max_chunk_size` characters, except a
//!   [`CitationAwareChunker`] chunk extended to keep a citation whole.
//! - Chunk `i + 1` starts exactly `overlap` characters before chunk `i`
//!   ends. The first and last chunks touch the document boundaries.
//! - Every cut is at least `min_chunk_size` characters after the chunk
//!   start; only the final chunk may be shorter.
//! - Blank text yields no chunks.
//!
//! # Example
//!
//! ```rust
//! use rag_lifecycle_core::chunk::{chunk_text, ChunkConfig, StrategyKind};
//!
//! let config = ChunkConfig { max_chunk_size: 40, overlap: 5, min_chunk_size: 10, preserve_citations: false };
//! let text = "First sentence here. Second sentence follows. Third one ends it.";
//! let chunks = chunk_text(text, StrategyKind::Sentence, &config).unwrap();
//! assert!(chunks.len() > 1);
//! assert!(chunks.iter().all(|c| c.char_len() <= 40));
//! ```

mod analysis;
pub mod citation;
mod strategies;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ChunkError;
use crate::models::Chunk;

use analysis::{Analysis, Break};

pub use strategies::{
    AdaptiveChunker, CitationAwareChunker, HybridChunker, ParagraphChunker, SemanticChunker,
    SentenceChunker,
};

/// Tag naming a chunking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Sentence,
    Paragraph,
    Semantic,
    Hybrid,
    Adaptive,
    CitationAware,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::Sentence,
        StrategyKind::Paragraph,
        StrategyKind::Semantic,
        StrategyKind::Hybrid,
        StrategyKind::Adaptive,
        StrategyKind::CitationAware,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Sentence => "sentence",
            StrategyKind::Paragraph => "paragraph",
            StrategyKind::Semantic => "semantic",
            StrategyKind::Hybrid => "hybrid",
            StrategyKind::Adaptive => "adaptive",
            StrategyKind::CitationAware => "citation_aware",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ChunkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ChunkError::UnknownStrategy(s.to_string()))
    }
}

/// Size policy shared by all strategies. Sizes are in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    pub max_chunk_size: usize,
    pub overlap: usize,
    pub min_chunk_size: usize,
    /// Prefer cuts that do not split citations.
    pub preserve_citations: bool,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1024,
            overlap: 128,
            min_chunk_size: 256,
            preserve_citations: true,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.max_chunk_size == 0 {
            return Err(ChunkError::InvalidConfig(
                "max_chunk_size must be > 0".to_string(),
            ));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(ChunkError::InvalidConfig(format!(
                "min_chunk_size ({}) must be <= max_chunk_size ({})",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        if self.overlap >= self.min_chunk_size.max(1) {
            return Err(ChunkError::InvalidConfig(format!(
                "overlap ({}) must be < min_chunk_size ({})",
                self.overlap, self.min_chunk_size
            )));
        }
        Ok(())
    }
}

/// A chunking policy.
///
/// The returned chunks are ordered by position with contiguous indices
/// starting at 0.
pub trait ChunkingStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Result<Vec<Chunk>, ChunkError>;
}

/// Instantiate the strategy for a tag.
pub fn strategy_for(kind: StrategyKind) -> Box<dyn ChunkingStrategy> {
    match kind {
        StrategyKind::Sentence => Box::new(SentenceChunker),
        StrategyKind::Paragraph => Box::new(ParagraphChunker),
        StrategyKind::Semantic => Box::new(SemanticChunker),
        StrategyKind::Hybrid => Box::new(HybridChunker),
        StrategyKind::Adaptive => Box::new(AdaptiveChunker),
        StrategyKind::CitationAware => Box::new(CitationAwareChunker),
    }
}

/// Chunk `text` with the strategy named by `kind`.
pub fn chunk_text(
    text: &str,
    kind: StrategyKind,
    config: &ChunkConfig,
) -> Result<Vec<Chunk>, ChunkError> {
    strategy_for(kind).chunk(text, config)
}

/// SHA-256 hex digest of a chunk's text.
pub fn hash_chunk_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Where a strategy prefers to cut. Implemented by each strategy and
/// consumed by [`assemble`].
pub(crate) trait CutPolicy {
    fn kind(&self) -> StrategyKind;

    fn needs_topics(&self) -> bool {
        false
    }

    /// Maximum length of the window starting at `start`.
    fn window_size(&self, _analysis: &Analysis<'_>, _start: usize, config: &ChunkConfig) -> usize {
        config.max_chunk_size
    }

    /// Choose a cut among `candidates` (all within `[lo, hi]`).
    fn pick(&self, analysis: &Analysis<'_>, candidates: &[Break], start: usize, hi: usize)
        -> Option<usize>;

    /// Citations are guarded even when `preserve_citations` is off, and a
    /// chunk may grow past the window to keep one whole.
    fn citation_aware(&self) -> bool {
        false
    }
}

/// The shared windowing driver.
pub(crate) fn assemble<P: CutPolicy>(
    text: &str,
    config: &ChunkConfig,
    policy: &P,
) -> Result<Vec<Chunk>, ChunkError> {
    config.validate()?;

    let analysis = Analysis::new(text, policy.needs_topics());
    if analysis.is_blank() {
        return Ok(Vec::new());
    }

    let n = analysis.len();
    let guard = policy.citation_aware() || config.preserve_citations;
    let overlap = config.overlap;
    let bisects = |pos: usize| {
        pos < n && (analysis.inside_citation(pos) || analysis.inside_citation(pos - overlap))
    };

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let window = policy
            .window_size(&analysis, start, config)
            .clamp(overlap + 1, config.max_chunk_size);
        if n - start <= window {
            chunks.push(make_chunk(&analysis, chunks.len(), start, n, policy.kind(), false));
            break;
        }

        let lo = start + config.min_chunk_size.max(overlap + 1).min(window);
        let hi = start + window;
        let candidates = analysis.breaks_between(lo, hi);
        let natural = policy.pick(&analysis, candidates, start, hi).unwrap_or(hi);

        let (cut, moved) = if guard && bisects(natural) {
            let safe: Vec<Break> = candidates
                .iter()
                .copied()
                .filter(|b| !bisects(b.pos))
                .collect();
            let within = policy
                .pick(&analysis, &safe, start, hi)
                .or_else(|| (lo..=hi).rev().find(|&p| !bisects(p)));
            match within {
                Some(p) => (p, true),
                None if policy.citation_aware() => {
                    let p = (hi + 1..=n).find(|&p| !bisects(p)).unwrap_or(n);
                    (p, true)
                }
                None => (natural, false),
            }
        } else {
            (natural, false)
        };

        if cut >= n {
            chunks.push(make_chunk(&analysis, chunks.len(), start, n, policy.kind(), moved));
            break;
        }
        chunks.push(make_chunk(&analysis, chunks.len(), start, cut, policy.kind(), moved));
        start = cut - overlap;
    }

    Ok(chunks)
}

fn make_chunk(
    analysis: &Analysis<'_>,
    index: usize,
    start: usize,
    end: usize,
    strategy: StrategyKind,
    citation_boundary: bool,
) -> Chunk {
    let text = analysis.slice(start, end);
    Chunk {
        index,
        text: text.to_string(),
        start: analysis.byte_offset(start),
        end: analysis.byte_offset(end),
        strategy,
        citation_boundary,
        hash: hash_chunk_text(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn char_pos(text: &str, byte: usize) -> usize {
        text[..byte].chars().count()
    }

    fn sample_text() -> String {
        let paragraphs = [
            "Retrieval augmented generation combines search with language models. \
             The retriever finds passages. The generator writes the answer from them.",
            "Index maintenance matters in production. Stale indexes return outdated \
             passages [4]. Corrupted indexes fail outright (Nguyen et al., 2021).",
            "Chunking decides what a passage is! Small chunks are precise. Large chunks \
             carry more context? Overlap keeps sentences that straddle a cut retrievable.",
            "Dense tables like 3.14, 2.71, 1.41, 1.73, 0.57 and ID-9981-XK-77 compress \
             poorly. See doi:10.1000/182 for the benchmark.",
        ];
        paragraphs.join("\n\n")
    }

    fn check_invariants(text: &str, chunks: &[Chunk], config: &ChunkConfig, allow_exceed: bool) {
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, text.len());
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert_eq!(&text[c.start..c.end], c.text);
            assert_eq!(c.hash, hash_chunk_text(&c.text));
            if !(allow_exceed && c.citation_boundary) {
                assert!(
                    c.char_len() <= config.max_chunk_size,
                    "chunk {} has {} chars",
                    i,
                    c.char_len()
                );
            }
        }
        for pair in chunks.windows(2) {
            let prev_end = char_pos(text, pair[0].end);
            let next_start = char_pos(text, pair[1].start);
            assert_eq!(prev_end - next_start, config.overlap);
            assert!(prev_end - char_pos(text, pair[0].start) >= config.min_chunk_size);
        }
    }

    #[test]
    fn test_all_strategies_hold_size_and_overlap() {
        let text = sample_text();
        for overlap in [0, 7, 20] {
            let config = ChunkConfig {
                max_chunk_size: 120,
                overlap,
                min_chunk_size: 40,
                preserve_citations: false,
            };
            for kind in StrategyKind::ALL {
                let chunks = chunk_text(&text, kind, &config).unwrap();
                assert!(chunks.len() > 3, "{kind} produced {}", chunks.len());
                assert!(chunks.iter().all(|c| c.strategy == kind));
                check_invariants(&text, &chunks, &config, kind == StrategyKind::CitationAware);
            }
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let config = ChunkConfig::default();
        let chunks = chunk_text("Hello, world!", StrategyKind::Sentence, &config).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn test_blank_text_has_no_chunks() {
        let config = ChunkConfig::default();
        for kind in StrategyKind::ALL {
            assert!(chunk_text("", kind, &config).unwrap().is_empty());
            assert!(chunk_text(" \n\n\t ", kind, &config).unwrap().is_empty());
        }
    }

    #[test]
    fn test_hard_split_without_whitespace() {
        let text = "x".repeat(250);
        let config = ChunkConfig {
            max_chunk_size: 100,
            overlap: 10,
            min_chunk_size: 50,
            preserve_citations: false,
        };
        let chunks = chunk_text(&text, StrategyKind::Paragraph, &config).unwrap();
        check_invariants(&text, &chunks, &config, false);
        assert_eq!(chunks[0].char_len(), 100);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = [
            ChunkConfig {
                max_chunk_size: 0,
                overlap: 0,
                min_chunk_size: 0,
                preserve_citations: false,
            },
            ChunkConfig {
                max_chunk_size: 10,
                overlap: 0,
                min_chunk_size: 20,
                preserve_citations: false,
            },
            ChunkConfig {
                max_chunk_size: 100,
                overlap: 50,
                min_chunk_size: 50,
                preserve_citations: false,
            },
        ];
        for config in bad {
            assert!(matches!(
                chunk_text("some text", StrategyKind::Sentence, &config),
                Err(ChunkError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_citation_aware_never_bisects() {
        let text = format!(
            "{} (Abernathy-Whitcombe et al., 2019) and more words after it to finish.",
            "word ".repeat(18)
        );
        let config = ChunkConfig {
            max_chunk_size: 100,
            overlap: 5,
            min_chunk_size: 95,
            preserve_citations: false,
        };
        let spans = citation::find_citations(&text);
        assert_eq!(spans.len(), 1);
        let span = spans[0].clone();

        let chunks = chunk_text(&text, StrategyKind::CitationAware, &config).unwrap();
        for c in &chunks {
            assert!(
                !(c.end > span.start && c.end < span.end),
                "chunk end {} bisects citation {:?}",
                c.end,
                span
            );
        }
        assert!(chunks.iter().any(|c| c.citation_boundary));
        check_invariants(&text, &chunks, &config, true);
    }

    #[test]
    fn test_sentence_strategy_may_split_citation_when_not_preserving() {
        let text = format!("{}[12, 13, 14, 15] tail text here", "abcdefghij".repeat(9));
        let config = ChunkConfig {
            max_chunk_size: 95,
            overlap: 0,
            min_chunk_size: 90,
            preserve_citations: false,
        };
        let chunks = chunk_text(&text, StrategyKind::Sentence, &config).unwrap();
        assert!(chunks.iter().all(|c| c.char_len() <= 95));
        assert!(chunks.iter().all(|c| !c.citation_boundary));
    }

    #[test]
    fn test_preserve_citations_moves_cut_within_limit() {
        let text = format!("{}[12, 13, 14, 15] tail text here", "abcdefghij".repeat(9));
        let config = ChunkConfig {
            max_chunk_size: 95,
            overlap: 0,
            min_chunk_size: 80,
            preserve_citations: true,
        };
        let chunks = chunk_text(&text, StrategyKind::Sentence, &config).unwrap();
        assert!(chunks.iter().all(|c| c.char_len() <= 95));
        assert!(chunks[0].citation_boundary);
        assert_eq!(chunks[0].end, 90);
    }

    #[test]
    fn test_strategy_kind_parse() {
        assert_eq!(
            "citation_aware".parse::<StrategyKind>().unwrap(),
            StrategyKind::CitationAware
        );
        assert!(matches!(
            "fixed".parse::<StrategyKind>(),
            Err(ChunkError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_deterministic() {
        let text = sample_text();
        let config = ChunkConfig {
            max_chunk_size: 90,
            overlap: 10,
            min_chunk_size: 30,
            preserve_citations: true,
        };
        for kind in StrategyKind::ALL {
            let a = chunk_text(&text, kind, &config).unwrap();
            let b = chunk_text(&text, kind, &config).unwrap();
            assert_eq!(a, b);
        }
    }
}
