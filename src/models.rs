//! Core data models used throughout QuizForge.
//!
//! These types represent the sources, passages, and questions that flow
//! through the ingestion, retrieval, and generation pipeline.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pre-extracted document handed to the ingestion pipeline.
///
/// Format parsing (PDF, office, e-book) happens upstream; ingestion only
/// sees a filename plus one text blob per page.
#[derive(Debug, Clone)]
pub struct PageSet {
    pub filename: String,
    pub pages: Vec<String>,
}

/// Source row persisted in SQLite.
#[derive(Debug, Clone)]
pub struct Source {
    pub id: i64,
    pub filename: String,
    pub content_hash: String,
    pub pages: i64,
    pub imported_at: DateTime<Utc>,
}

/// A ranked passage returned from the retrieval ranker.
#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    pub chunk_id: i64,
    pub source_id: i64,
    pub source: String,
    pub page: i64,
    pub quote: String,
    pub text: String,
    pub score: f64,
}

/// Question kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuestionKind {
    YesNo,
    MultipleChoice,
}

impl QuestionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::YesNo => "YN",
            QuestionKind::MultipleChoice => "MCQ",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "YN" | "YESNO" => Ok(QuestionKind::YesNo),
            "MCQ" | "MULTIPLECHOICE" => Ok(QuestionKind::MultipleChoice),
            other => bail!("Unknown question kind: '{}'. Use yn or mcq.", other),
        }
    }
}

/// Yes/no answer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YnAnswer {
    Yes,
    No,
}

impl YnAnswer {
    pub fn as_str(&self) -> &'static str {
        match self {
            YnAnswer::Yes => "YES",
            YnAnswer::No => "NO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "YES" => Some(YnAnswer::Yes),
            "NO" => Some(YnAnswer::No),
            _ => None,
        }
    }
}

/// Correct-option letter for multiple-choice questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionLetter {
    A,
    B,
    C,
    D,
}

impl OptionLetter {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionLetter::A => "a",
            OptionLetter::B => "b",
            OptionLetter::C => "c",
            OptionLetter::D => "d",
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'a' => Some(OptionLetter::A),
            'b' => Some(OptionLetter::B),
            'c' => Some(OptionLetter::C),
            'd' => Some(OptionLetter::D),
            _ => None,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            OptionLetter::A => 0,
            OptionLetter::B => 1,
            OptionLetter::C => 2,
            OptionLetter::D => 3,
        }
    }
}

/// Inline citation marker `[source|p.N]` linking a claim to one passage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CitationTag {
    pub source: String,
    pub page: i64,
}

impl CitationTag {
    pub fn render(&self) -> String {
        format!("[{}|p.{}]", self.source, self.page)
    }
}

/// Explanation attached to a question: one citation tag plus rationale text.
#[derive(Debug, Clone)]
pub struct Explanation {
    pub tag: CitationTag,
    pub rationale: String,
}

impl Explanation {
    pub fn render(&self) -> String {
        format!("{} {}", self.tag.render(), self.rationale.trim())
    }
}

/// A citation row: the passage a question's explanation references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub page: i64,
    pub quote: String,
}

/// Generation metadata stored alongside each question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionMeta {
    pub topic: String,
    pub difficulty: String,
    pub timestamp: DateTime<Utc>,
}

impl QuestionMeta {
    pub fn new(topic: Option<&str>, difficulty: Option<&str>) -> Self {
        Self {
            topic: topic.unwrap_or("general").to_string(),
            difficulty: difficulty.unwrap_or("medium").to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// A validated question, immutable after construction.
#[derive(Debug, Clone)]
pub enum Question {
    YesNo {
        stem: String,
        answer: YnAnswer,
        explanation: Explanation,
    },
    MultipleChoice {
        stem: String,
        options: [String; 4],
        answer: OptionLetter,
        explanation: Explanation,
    },
}

impl Question {
    pub fn kind(&self) -> QuestionKind {
        match self {
            Question::YesNo { .. } => QuestionKind::YesNo,
            Question::MultipleChoice { .. } => QuestionKind::MultipleChoice,
        }
    }

    pub fn stem(&self) -> &str {
        match self {
            Question::YesNo { stem, .. } => stem,
            Question::MultipleChoice { stem, .. } => stem,
        }
    }

    pub fn options(&self) -> &[String] {
        match self {
            Question::YesNo { .. } => &[],
            Question::MultipleChoice { options, .. } => options,
        }
    }

    pub fn answer_str(&self) -> &'static str {
        match self {
            Question::YesNo { answer, .. } => answer.as_str(),
            Question::MultipleChoice { answer, .. } => answer.as_str(),
        }
    }

    pub fn explanation(&self) -> &Explanation {
        match self {
            Question::YesNo { explanation, .. } => explanation,
            Question::MultipleChoice { explanation, .. } => explanation,
        }
    }
}

/// Marker carried by fallback-path questions so callers can filter them.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackInfo {
    pub reason: String,
}

/// Pipeline output: a question plus its metadata and derived citations.
#[derive(Debug, Clone)]
pub struct GeneratedQuestion {
    pub question: Question,
    pub metadata: QuestionMeta,
    pub citations: Vec<Citation>,
    pub fallback: Option<FallbackInfo>,
}

impl GeneratedQuestion {
    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// A generated question that made it past deduplication into storage.
#[derive(Debug, Clone)]
pub struct StoredQuestion {
    pub id: String,
    pub fingerprint: String,
    pub generated: GeneratedQuestion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        assert_eq!(QuestionKind::parse("yn").unwrap(), QuestionKind::YesNo);
        assert_eq!(
            QuestionKind::parse("MCQ").unwrap(),
            QuestionKind::MultipleChoice
        );
        assert!(QuestionKind::parse("essay").is_err());
    }

    #[test]
    fn test_citation_tag_render() {
        let tag = CitationTag {
            source: "A.pdf".to_string(),
            page: 3,
        };
        assert_eq!(tag.render(), "[A.pdf|p.3]");
    }

    #[test]
    fn test_explanation_render() {
        let e = Explanation {
            tag: CitationTag {
                source: "notes.pdf".to_string(),
                page: 12,
            },
            rationale: "  The passage states this directly.  ".to_string(),
        };
        assert_eq!(
            e.render(),
            "[notes.pdf|p.12] The passage states this directly."
        );
    }

    #[test]
    fn test_option_letter() {
        assert_eq!(OptionLetter::from_letter('B').unwrap(), OptionLetter::B);
        assert_eq!(OptionLetter::B.index(), 1);
        assert!(OptionLetter::from_letter('e').is_none());
    }
}
