//! Question fingerprinting and the batch generation loop.
//!
//! A fingerprint is a normalized SHA-256 over kind + stem + options, so
//! duplicates differing only in case, punctuation, or whitespace collapse
//! to the same value. Uniqueness is enforced globally across topics and
//! difficulties by the `questions.fingerprint` UNIQUE constraint; recent
//! stems merely bias prompts away from repetition, acceptance is gated by
//! the fingerprint alone.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::completion::TextCompletionProvider;
use crate::config::GenerationConfig;
use crate::generate::generate_question;
use crate::models::{GeneratedQuestion, Passage, Question, QuestionKind, StoredQuestion};

/// Lowercase, strip non-alphanumerics to spaces, collapse runs.
fn normalize_part(part: &str) -> String {
    let mapped: String = part
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Content fingerprint of a question. Option order is preserved: the same
/// options shuffled ask a different question.
pub fn fingerprint(kind: QuestionKind, stem: &str, options: &[String]) -> String {
    let mut parts = vec![normalize_part(kind.as_str()), normalize_part(stem)];
    for option in options {
        parts.push(normalize_part(option));
    }

    let mut hasher = Sha256::new();
    hasher.update(parts.join("\n").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn fingerprint_of(question: &Question) -> String {
    fingerprint(question.kind(), question.stem(), question.options())
}

/// Most recent stems stored for (kind, topic), newest first. Fed into the
/// generation prompt as "do not repeat" hints.
pub async fn recent_stems(
    pool: &SqlitePool,
    kind: QuestionKind,
    topic: &str,
    limit: i64,
) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT stem FROM questions \
         WHERE kind = ? AND json_extract(metadata, '$.topic') = ? \
         ORDER BY created_at DESC, rowid DESC LIMIT ?",
    )
    .bind(kind.as_str())
    .bind(topic)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(|r| r.get("stem")).collect())
}

async fn fingerprint_exists(pool: &SqlitePool, fp: &str) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM questions WHERE fingerprint = ?")
        .bind(fp)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Persist a generated question and its citations.
///
/// Returns `None` when another writer inserted the same fingerprint first;
/// the UNIQUE violation is a silent drop, not an error.
pub async fn store_question(
    pool: &SqlitePool,
    generated: GeneratedQuestion,
    fp: String,
) -> Result<Option<StoredQuestion>> {
    let id = Uuid::new_v4().to_string();

    let options_json = match &generated.question {
        Question::MultipleChoice { options, .. } => Some(serde_json::to_string(options)?),
        Question::YesNo { .. } => None,
    };
    let metadata_json = serde_json::to_string(&generated.metadata)?;

    let inserted = sqlx::query(
        "INSERT INTO questions (id, kind, stem, options, answer, explanation, \
         metadata, fingerprint, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(generated.question.kind().as_str())
    .bind(generated.question.stem())
    .bind(&options_json)
    .bind(generated.question.answer_str())
    .bind(generated.question.explanation().render())
    .bind(&metadata_json)
    .bind(&fp)
    .bind(generated.metadata.timestamp.to_rfc3339())
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => {}
        Err(e) => {
            let unique = e
                .as_database_error()
                .map(|d| d.is_unique_violation())
                .unwrap_or(false);
            if unique {
                return Ok(None);
            }
            return Err(e.into());
        }
    }

    // Citations referencing sources outside the store (the synthetic
    // fallback source on an empty corpus) are not persisted.
    for citation in &generated.citations {
        let source_row = sqlx::query("SELECT id FROM sources WHERE filename = ?")
            .bind(&citation.source)
            .fetch_optional(pool)
            .await?;
        let Some(source_row) = source_row else {
            continue;
        };
        let source_id: i64 = source_row.get("id");

        sqlx::query(
            "INSERT INTO question_citations (question_id, source_id, page, quote) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(source_id)
        .bind(citation.page)
        .bind(&citation.quote)
        .execute(pool)
        .await?;
    }

    Ok(Some(StoredQuestion {
        id,
        fingerprint: fp,
        generated,
    }))
}

/// Generate and persist up to `count` unique questions.
///
/// Each requested item gets a bounded number of candidate attempts; a
/// candidate whose fingerprint matches an earlier batch member or a stored
/// question is discarded and the attempt retried. An item whose budget runs
/// out is omitted: short batches are an expected outcome, never an error.
#[allow(clippy::too_many_arguments)]
pub async fn generate_batch(
    pool: &SqlitePool,
    provider: &dyn TextCompletionProvider,
    config: &GenerationConfig,
    passages: &[Passage],
    kind: QuestionKind,
    topic: Option<&str>,
    difficulty: Option<&str>,
    count: u32,
) -> Result<Vec<StoredQuestion>> {
    let topic_key = topic.unwrap_or("general");
    let mut avoid = recent_stems(pool, kind, topic_key, config.history_limit).await?;

    let mut batch: Vec<StoredQuestion> = Vec::new();
    let mut batch_fps: Vec<String> = Vec::new();

    for item in 0..count {
        // Budget exhaustion just omits this item from the batch.
        for _attempt in 0..config.batch_attempts_per_item {
            let generated = generate_question(
                provider,
                config,
                passages,
                kind,
                topic,
                difficulty,
                item + 1,
                &avoid,
            )
            .await;

            let fp = fingerprint_of(&generated.question);
            if batch_fps.contains(&fp) || fingerprint_exists(pool, &fp).await? {
                continue;
            }

            if let Some(stored) = store_question(pool, generated, fp.clone()).await? {
                avoid.push(stored.generated.question.stem().to_string());
                batch_fps.push(fp);
                batch.push(stored);
                break;
            }
        }
    }

    Ok(batch)
}
