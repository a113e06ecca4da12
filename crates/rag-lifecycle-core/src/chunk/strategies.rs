//! The six chunking strategies.

use super::analysis::{Analysis, Break, BreakKind};
use super::{assemble, ChunkConfig, ChunkingStrategy, CutPolicy, StrategyKind};
use crate::error::ChunkError;
use crate::models::Chunk;

fn latest_of(candidates: &[Break], kind: BreakKind) -> Option<usize> {
    candidates
        .iter()
        .rev()
        .find(|b| b.kind >= kind)
        .map(|b| b.pos)
}

/// Latest sentence end, falling back to the latest word boundary.
fn sentence_pick(candidates: &[Break]) -> Option<usize> {
    latest_of(candidates, BreakKind::Sentence).or_else(|| latest_of(candidates, BreakKind::Word))
}

/// Cuts at the last sentence end that fits.
pub struct SentenceChunker;

impl CutPolicy for SentenceChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sentence
    }

    fn pick(&self, _: &Analysis<'_>, candidates: &[Break], _: usize, _: usize) -> Option<usize> {
        sentence_pick(candidates)
    }
}

impl ChunkingStrategy for SentenceChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sentence
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Result<Vec<Chunk>, ChunkError> {
        assemble(text, config, self)
    }
}

/// Cuts at blank lines, degrading to sentence then word boundaries.
pub struct ParagraphChunker;

impl CutPolicy for ParagraphChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Paragraph
    }

    fn pick(&self, _: &Analysis<'_>, candidates: &[Break], _: usize, _: usize) -> Option<usize> {
        latest_of(candidates, BreakKind::Paragraph).or_else(|| sentence_pick(candidates))
    }
}

impl ChunkingStrategy for ParagraphChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Paragraph
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Result<Vec<Chunk>, ChunkError> {
        assemble(text, config, self)
    }
}

const PARAGRAPH_BONUS: f32 = 0.25;

/// Cuts where the vocabulary changes most between adjacent sentences.
pub struct SemanticChunker;

impl CutPolicy for SemanticChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Semantic
    }

    fn needs_topics(&self) -> bool {
        true
    }

    fn pick(&self, analysis: &Analysis<'_>, candidates: &[Break], _: usize, _: usize) -> Option<usize> {
        best_by(candidates, |b| {
            let bonus = if b.kind == BreakKind::Paragraph {
                PARAGRAPH_BONUS
            } else {
                0.0
            };
            analysis.shift_at(b.pos) + bonus
        })
        .or_else(|| latest_of(candidates, BreakKind::Word))
    }
}

impl ChunkingStrategy for SemanticChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Semantic
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Result<Vec<Chunk>, ChunkError> {
        assemble(text, config, self)
    }
}

/// Balances filling the window against cutting at topic shifts.
pub struct HybridChunker;

impl CutPolicy for HybridChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hybrid
    }

    fn needs_topics(&self) -> bool {
        true
    }

    fn pick(&self, analysis: &Analysis<'_>, candidates: &[Break], start: usize, hi: usize) -> Option<usize> {
        let span = (hi - start).max(1) as f32;
        best_by(candidates, |b| {
            let fill = (b.pos - start) as f32 / span;
            0.5 * fill + 0.5 * analysis.shift_at(b.pos)
        })
        .or_else(|| latest_of(candidates, BreakKind::Word))
    }
}

impl ChunkingStrategy for HybridChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hybrid
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Result<Vec<Chunk>, ChunkError> {
        assemble(text, config, self)
    }
}

/// Shrinks the window for dense text (long words, digits, symbols).
pub struct AdaptiveChunker;

impl AdaptiveChunker {
    /// Density in `[0, 1]` of the characters in `[start, end)`.
    fn density(analysis: &Analysis<'_>, start: usize, end: usize) -> f32 {
        let chars = &analysis.chars[start..end];
        let non_space: Vec<char> = chars.iter().copied().filter(|c| !c.is_whitespace()).collect();
        if non_space.is_empty() {
            return 0.0;
        }
        let words = chars
            .split(|c| c.is_whitespace())
            .filter(|w| !w.is_empty())
            .count()
            .max(1);
        let avg_word = non_space.len() as f32 / words as f32;
        let symbols = non_space.iter().filter(|c| !c.is_alphabetic()).count() as f32;
        let symbol_ratio = symbols / non_space.len() as f32;

        let word_score = ((avg_word - 5.0) / 7.0).clamp(0.0, 1.0);
        (0.5 * word_score + 0.5 * symbol_ratio).clamp(0.0, 1.0)
    }
}

impl CutPolicy for AdaptiveChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Adaptive
    }

    fn window_size(&self, analysis: &Analysis<'_>, start: usize, config: &ChunkConfig) -> usize {
        let end = (start + config.max_chunk_size).min(analysis.len());
        let factor = 1.0 - 0.5 * Self::density(analysis, start, end);
        let scaled = (config.max_chunk_size as f32 * factor) as usize;
        let floor = config.min_chunk_size.max(config.overlap + 1);
        scaled.max(floor).min(config.max_chunk_size)
    }

    fn pick(&self, _: &Analysis<'_>, candidates: &[Break], _: usize, _: usize) -> Option<usize> {
        sentence_pick(candidates)
    }
}

impl ChunkingStrategy for AdaptiveChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Adaptive
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Result<Vec<Chunk>, ChunkError> {
        assemble(text, config, self)
    }
}

/// Sentence cuts that never split a citation, growing past the window
/// when no cut inside it keeps the citation whole.
pub struct CitationAwareChunker;

impl CutPolicy for CitationAwareChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CitationAware
    }

    fn pick(&self, _: &Analysis<'_>, candidates: &[Break], _: usize, _: usize) -> Option<usize> {
        sentence_pick(candidates)
    }

    fn citation_aware(&self) -> bool {
        true
    }
}

impl ChunkingStrategy for CitationAwareChunker {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CitationAware
    }

    fn chunk(&self, text: &str, config: &ChunkConfig) -> Result<Vec<Chunk>, ChunkError> {
        assemble(text, config, self)
    }
}

/// Highest-scoring sentence-or-stronger break; ties go to the later one.
fn best_by(candidates: &[Break], score: impl Fn(&Break) -> f32) -> Option<usize> {
    candidates
        .iter()
        .filter(|b| b.kind >= BreakKind::Sentence)
        .fold(None::<(usize, f32)>, |best, b| {
            let s = score(b);
            match best {
                Some((_, bs)) if bs > s => best,
                _ => Some((b.pos, s)),
            }
        })
        .map(|(pos, _)| pos)
}
