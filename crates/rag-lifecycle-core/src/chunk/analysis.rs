//! Text analysis shared by all chunking strategies.
//!
//! Positions are character indices; `offsets[i]` maps character `i` to
//! its byte offset, with `offsets[len]` equal to the text's byte length.

use std::collections::{HashMap, HashSet};

use super::citation::find_citations;

/// Strength of a candidate cut position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum BreakKind {
    Word,
    Sentence,
    Paragraph,
}

/// A position where a chunk may end. The chunk ends just before the
/// character at `pos`, which is the first character of the next word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Break {
    pub pos: usize,
    pub kind: BreakKind,
}

pub(crate) struct Analysis<'a> {
    pub text: &'a str,
    pub chars: Vec<char>,
    pub offsets: Vec<usize>,
    pub breaks: Vec<Break>,
    /// Citation spans as half-open character ranges.
    pub citations: Vec<(usize, usize)>,
    /// Topic shift (1 - lexical similarity) across each sentence break.
    pub topic_shift: HashMap<usize, f32>,
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "his", "how", "its", "may", "new", "now", "see", "who", "did",
    "this", "that", "with", "from", "they", "will", "have", "been", "were", "which", "their",
    "there", "these", "those", "than", "then", "into", "also", "such", "each", "when",
];

impl<'a> Analysis<'a> {
    pub fn new(text: &'a str, with_topics: bool) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        offsets.push(text.len());

        let breaks = find_breaks(&chars);
        let citations = find_citations(text)
            .into_iter()
            .map(|r| (char_index(&offsets, r.start), char_index(&offsets, r.end)))
            .collect();

        let mut analysis = Self {
            text,
            chars,
            offsets,
            breaks,
            citations,
            topic_shift: HashMap::new(),
        };
        if with_topics {
            analysis.topic_shift = analysis.compute_topic_shift();
        }
        analysis
    }

    /// Number of characters.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_blank(&self) -> bool {
        self.chars.iter().all(|c| c.is_whitespace())
    }

    /// Text between two character positions.
    pub fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.text[self.offsets[start]..self.offsets[end]]
    }

    pub fn byte_offset(&self, pos: usize) -> usize {
        self.offsets[pos]
    }

    /// Breaks with `lo <= pos <= hi`.
    pub fn breaks_between(&self, lo: usize, hi: usize) -> &[Break] {
        let from = self.breaks.partition_point(|b| b.pos < lo);
        let to = self.breaks.partition_point(|b| b.pos <= hi);
        &self.breaks[from..to.max(from)]
    }

    /// Whether `pos` falls strictly inside a citation span.
    pub fn inside_citation(&self, pos: usize) -> bool {
        self.citations.iter().any(|&(s, e)| s < pos && pos < e)
    }

    pub fn shift_at(&self, pos: usize) -> f32 {
        self.topic_shift.get(&pos).copied().unwrap_or(0.0)
    }

    fn compute_topic_shift(&self) -> HashMap<usize, f32> {
        let sentence_ends: Vec<usize> = self
            .breaks
            .iter()
            .filter(|b| b.kind >= BreakKind::Sentence)
            .map(|b| b.pos)
            .collect();

        let mut bounds = Vec::with_capacity(sentence_ends.len() + 2);
        bounds.push(0);
        bounds.extend(sentence_ends.iter().copied());
        bounds.push(self.len());

        let token_sets: Vec<HashSet<String>> = bounds
            .windows(2)
            .map(|w| content_words(self.slice(w[0], w[1])))
            .collect();

        sentence_ends
            .iter()
            .enumerate()
            .map(|(i, &pos)| (pos, 1.0 - jaccard(&token_sets[i], &token_sets[i + 1])))
            .collect()
    }
}

fn char_index(offsets: &[usize], byte: usize) -> usize {
    offsets.partition_point(|&o| o < byte)
}

fn find_breaks(chars: &[char]) -> Vec<Break> {
    let n = chars.len();
    let mut breaks = Vec::new();
    let mut i = 0;
    while i < n {
        if !chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        let run_start = i;
        let mut newlines = 0;
        while i < n && chars[i].is_whitespace() {
            if chars[i] == '\n' {
                newlines += 1;
            }
            i += 1;
        }
        if run_start == 0 || i == n {
            continue;
        }
        let kind = if newlines >= 2 {
            BreakKind::Paragraph
        } else if ends_sentence(&chars[..run_start]) {
            BreakKind::Sentence
        } else {
            BreakKind::Word
        };
        breaks.push(Break { pos: i, kind });
    }
    breaks
}

fn ends_sentence(prefix: &[char]) -> bool {
    let mut j = prefix.len();
    while j > 0 && matches!(prefix[j - 1], '"' | '\'' | ')' | ']' | '”' | '’') {
        j -= 1;
    }
    j > 0 && matches!(prefix[j - 1], '.' | '!' | '?')
}

fn content_words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    inter / union
}
