//! Shared parsing and normalization utilities for the generation pipeline.
//!
//! Covers the three text-processing concerns every generation shares:
//! citation-tag handling (`[source|p.N]` markers in explanations), passage
//! snippet selection for prompt context, and tolerant JSON extraction from
//! model output.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::{Citation, CitationTag, Passage};

/// Minimum rationale length (chars) after the citation tag is stripped.
pub const MIN_RATIONALE_CHARS: usize = 12;

/// Maximum snippet length used in prompt context and stored quotes.
pub const SNIPPET_MAX_CHARS: usize = 180;

static TAG_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^|\]]+\|p\.\d+\]").unwrap());

static TAG_CAPTURE_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^|\]]+)\|p\.(\d+)\]").unwrap());

static LEADING_TAG_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^|\]]+)\|p\.(\d+)\]\s*(.+)$").unwrap());

/// Patterns that mark a line as layout noise rather than content: page
/// counters ("82/157"), academic-year ranges ("2025/2026"), URLs.
static HEADER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\b\d+\s*/\s*\d+\b").unwrap(),
        Regex::new(r"\b\d{4}\s*/\s*\d{4}\b").unwrap(),
        Regex::new(r"(?i)https?://").unwrap(),
    ]
});

/// True when a line looks like a slide header, page footer, or similar
/// non-content noise that must not seed a question.
pub fn looks_like_header(text: &str) -> bool {
    let s = text.trim();
    if s.is_empty() || s.chars().count() < 18 {
        return true;
    }
    HEADER_PATTERNS.iter().any(|rx| rx.is_match(s))
}

/// Collapse all whitespace runs to single spaces and trim.
pub fn squash_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to `max` chars, appending `…` when anything was cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}

/// Pick a snippet for a passage: the stored quote when it carries content,
/// otherwise the first non-header line of the full text, otherwise the
/// squashed full text. Capped at [`SNIPPET_MAX_CHARS`].
pub fn pick_snippet(quote: &str, text: &str) -> String {
    let q = quote.trim();
    let s = if !q.is_empty() && !looks_like_header(q) {
        q.to_string()
    } else {
        text.lines()
            .map(str::trim)
            .find(|ln| !ln.is_empty() && !looks_like_header(ln))
            .map(str::to_string)
            .unwrap_or_else(|| squash_whitespace(text))
    };

    truncate_chars(&squash_whitespace(&s), SNIPPET_MAX_CHARS)
}

/// Number of citation tags in an explanation.
pub fn count_tags(text: &str) -> usize {
    TAG_RX.find_iter(text).count()
}

/// All citation tags in order of appearance.
pub fn parse_tags(text: &str) -> Vec<CitationTag> {
    TAG_CAPTURE_RX
        .captures_iter(text)
        .filter_map(|cap| {
            let page: i64 = cap[2].parse().ok()?;
            Some(CitationTag {
                source: cap[1].to_string(),
                page,
            })
        })
        .collect()
}

/// Remove every citation tag, returning the trimmed remainder.
pub fn strip_tags(text: &str) -> String {
    TAG_RX.replace_all(text, "").trim().to_string()
}

/// Parse a leading `[source|p.N] rest` prefix from a context line.
pub fn parse_leading_tag(line: &str) -> Option<(CitationTag, String)> {
    let cap = LEADING_TAG_RX.captures(line.trim())?;
    let page: i64 = cap[2].parse().ok()?;
    Some((
        CitationTag {
            source: cap[1].to_string(),
            page,
        },
        cap[3].to_string(),
    ))
}

/// Normalize an explanation to carry exactly one citation tag plus a usable
/// rationale. Rescues model output with zero or multiple tags: the first
/// tag found wins, else the first citation; a too-short stripped rationale
/// is replaced by the matching citation's quote.
pub fn force_single_tag(explanation: &str, citations: &[Citation]) -> String {
    let explanation = explanation.trim();

    let tags = parse_tags(explanation);
    let tag = if let Some(first) = tags.first() {
        first.clone()
    } else if let Some(c) = citations.first() {
        CitationTag {
            source: c.source.clone(),
            page: c.page,
        }
    } else {
        return explanation.to_string();
    };

    let mut rationale = strip_tags(explanation);
    if rationale.chars().count() < MIN_RATIONALE_CHARS {
        let quote = citations
            .iter()
            .find(|c| c.source == tag.source && c.page == tag.page)
            .map(|c| c.quote.trim().to_string())
            .unwrap_or_default();
        rationale = if quote.is_empty() {
            "The rationale follows from the cited passage.".to_string()
        } else {
            quote
        };
    }

    format!("{} {}", tag.render(), rationale).trim().to_string()
}

/// If an explanation is a bare tag, append the matching citation's quote so
/// the rationale requirement can still hold.
pub fn ensure_rationale(explanation: &str, citations: &[Citation]) -> String {
    let explanation = explanation.trim();
    let Some(tag) = parse_tags(explanation).into_iter().next() else {
        return explanation.to_string();
    };

    if !strip_tags(explanation).is_empty() {
        return explanation.to_string();
    }

    if let Some(c) = citations
        .iter()
        .find(|c| c.source == tag.source && c.page == tag.page)
    {
        let quote = c.quote.trim();
        if !quote.is_empty() {
            return format!("{} {}", tag.render(), quote);
        }
    }

    explanation.to_string()
}

/// Keep only the citations referenced by tags in the explanation.
/// With no tags at all, keep at most the first two.
pub fn filter_citations(explanation: &str, citations: &[Citation]) -> Vec<Citation> {
    let tags = parse_tags(explanation);
    if tags.is_empty() {
        return citations.iter().take(2).cloned().collect();
    }

    let kept: Vec<Citation> = citations
        .iter()
        .filter(|c| tags.iter().any(|t| t.source == c.source && t.page == c.page))
        .cloned()
        .collect();

    if kept.is_empty() {
        citations.iter().take(2).cloned().collect()
    } else {
        kept
    }
}

/// Flattened prompt context: one `[source|p.N] snippet` line per passage
/// plus the parallel citation list.
pub struct FlattenedContext {
    pub body: String,
    pub citations: Vec<Citation>,
}

/// Flatten ranked passages into prompt context.
///
/// Passages are deduplicated by (source, page) keeping rank order; each
/// contributes one tagged snippet line. The joined body is capped at
/// `cap_chars` so oversized corpora cannot blow up the prompt.
pub fn flatten_passages(passages: &[Passage], cap_chars: usize) -> FlattenedContext {
    let mut seen: Vec<(String, i64)> = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    let mut citations: Vec<Citation> = Vec::new();

    for p in passages {
        let key = (p.source.clone(), p.page);
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);

        let snippet = pick_snippet(&p.quote, &p.text);
        if !snippet.is_empty() {
            lines.push(format!("[{}|p.{}] {}", p.source, p.page, snippet));
        }

        citations.push(Citation {
            source: p.source.clone(),
            page: p.page,
            quote: snippet,
        });
    }

    let body: String = lines.join("\n").chars().take(cap_chars).collect();
    FlattenedContext { body, citations }
}

// ============ JSON extraction ============

/// Extract a JSON object from model output.
///
/// Tries, in order: a fenced ```json block, the whole trimmed string, and
/// the first brace-balanced substring (string- and escape-aware). Returns
/// `None` when nothing parses to an object.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let s = text.trim();
    if s.is_empty() {
        return None;
    }

    // Fenced block
    static FENCE_RX: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?is)```(?:json)?\s*(\{.*?\})\s*```").unwrap()
    });
    if let Some(cap) = FENCE_RX.captures(s) {
        if let Some(obj) = try_parse_object(&cap[1]) {
            return Some(obj);
        }
    }

    // Whole string is JSON
    if s.starts_with('{') && s.ends_with('}') {
        if let Some(obj) = try_parse_object(s) {
            return Some(obj);
        }
    }

    // First brace-balanced object
    let start = s.find('{')?;
    let bytes: Vec<char> = s[start..].chars().collect();
    let mut depth = 0usize;
    let mut in_str = false;
    let mut esc = false;

    for (i, ch) in bytes.iter().enumerate() {
        if in_str {
            if esc {
                esc = false;
            } else if *ch == '\\' {
                esc = true;
            } else if *ch == '"' {
                in_str = false;
            }
        } else {
            match ch {
                '"' => in_str = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let blob: String = bytes[..=i].iter().collect();
                        return try_parse_object(&blob);
                    }
                }
                _ => {}
            }
        }
    }

    None
}

fn try_parse_object(blob: &str) -> Option<serde_json::Value> {
    match serde_json::from_str::<serde_json::Value>(blob.trim()) {
        Ok(v) if v.is_object() => Some(v),
        _ => None,
    }
}
