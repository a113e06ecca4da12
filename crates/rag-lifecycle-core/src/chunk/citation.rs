//! Citation span detection.
//!
//! Only locates spans; parsing them into bibliographic fields is not
//! this crate's job.

use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;

fn citation_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // [12], [3, 4], [5-7], [2–9]
            r"\[\d+(?:\s*[-–,]\s*\d+)*\]",
            // (Smith, 2020), (Smith et al., 2020a), (Smith and Jones 2019)
            r"\([A-Z][A-Za-z'’\-]+(?: et al\.)?(?: (?:and|&) [A-Z][A-Za-z'’\-]+)?,? \d{4}[a-z]?\)",
            // doi:10.1000/182, https://doi.org/10.1000/182
            r"(?:https?://(?:dx\.)?doi\.org/|doi:\s?)10\.\d{4,9}/[^\s\])>]+",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("citation pattern is valid"))
        .collect()
    })
}

/// Find citation spans in `text` as sorted, non-overlapping byte ranges.
pub fn find_citations(text: &str) -> Vec<Range<usize>> {
    let mut spans: Vec<Range<usize>> = citation_patterns()
        .iter()
        .flat_map(|re| re.find_iter(text).map(|m| m.start()..m.end()))
        .collect();
    spans.sort_by_key(|r| (r.start, r.end));

    let mut merged: Vec<Range<usize>> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start < last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans_text<'a>(text: &'a str) -> Vec<&'a str> {
        find_citations(text)
            .into_iter()
            .map(|r| &text[r])
            .collect()
    }

    #[test]
    fn test_numeric_brackets() {
        let text = "As shown before [12], and again [3, 4] or [5-7].";
        assert_eq!(spans_text(text), vec!["[12]", "[3, 4]", "[5-7]"]);
    }

    #[test]
    fn test_author_year() {
        let text = "Prior work (Smith et al., 2020a) and (Lee and Park 2019) agree.";
        assert_eq!(
            spans_text(text),
            vec!["(Smith et al., 2020a)", "(Lee and Park 2019)"]
        );
    }

    #[test]
    fn test_doi() {
        let text = "See doi:10.1000/182 or https://doi.org/10.1234/abc.def for details.";
        assert_eq!(
            spans_text(text),
            vec!["doi:10.1000/182", "https://doi.org/10.1234/abc.def"]
        );
    }

    #[test]
    fn test_no_citations() {
        assert!(find_citations("Plain prose (with a remark) and [brackets].").is_empty());
    }
}
