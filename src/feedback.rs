//! Rating feedback loop.
//!
//! A rating nudges the retrieval weights of every chunk on the pages a
//! question cited, moving future ranking toward well-rated material. This
//! is the only path through which chunk weights change.

use anyhow::{bail, Result};
use chrono::Utc;
use sqlx::SqlitePool;

/// Chunk weight floor. With the ranker's multiplier formula this bottoms
/// out at a 0.25x score multiplier.
pub const MIN_WEIGHT: f64 = -0.75;
/// Chunk weight ceiling, a 2.50x score multiplier.
pub const MAX_WEIGHT: f64 = 1.50;

/// Midpoint of the 1..=10 rating scale; ratings above it reward, below it
/// penalize.
const SCORE_MIDPOINT: f64 = 5.5;

#[derive(Debug)]
pub struct RatingOutcome {
    /// Score actually recorded, after clamping to 1..=10.
    pub score: i64,
    /// Weight delta applied to each affected chunk.
    pub delta: f64,
    /// Number of chunk weight rows adjusted.
    pub chunks_updated: u64,
}

/// Record a rating for a stored question and adjust chunk weights.
///
/// The rating row is append-only; re-rating a question stacks. The delta
/// `(score - 5.5) * gain` applies to every chunk sharing a (source, page)
/// with any citation of the question, clamped to
/// [`MIN_WEIGHT`]..=[`MAX_WEIGHT`].
pub async fn record_rating(
    pool: &SqlitePool,
    question_id: &str,
    score: i64,
    feedback: Option<&str>,
    gain: f64,
) -> Result<RatingOutcome> {
    let exists = sqlx::query("SELECT 1 FROM questions WHERE id = ?")
        .bind(question_id)
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        bail!("Unknown question id: {}", question_id);
    }

    let score = score.clamp(1, 10);
    let delta = (score as f64 - SCORE_MIDPOINT) * gain;

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO ratings (question_id, score, feedback, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(question_id)
    .bind(score)
    .bind(feedback)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *tx)
    .await?;

    // Chunks without a weight row get one at the neutral weight first.
    sqlx::query(
        "INSERT OR IGNORE INTO chunk_weights (chunk_id, weight) \
         SELECT DISTINCT c.id, 0 FROM chunks c \
         JOIN question_citations qc \
           ON qc.source_id = c.source_id AND qc.page = c.page \
         WHERE qc.question_id = ?",
    )
    .bind(question_id)
    .execute(&mut *tx)
    .await?;

    let updated = sqlx::query(
        "UPDATE chunk_weights SET weight = MIN(MAX(weight + ?, ?), ?) \
         WHERE chunk_id IN ( \
             SELECT c.id FROM chunks c \
             JOIN question_citations qc \
               ON qc.source_id = c.source_id AND qc.page = c.page \
             WHERE qc.question_id = ?)",
    )
    .bind(delta)
    .bind(MIN_WEIGHT)
    .bind(MAX_WEIGHT)
    .bind(question_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(RatingOutcome {
        score,
        delta,
        chunks_updated: updated.rows_affected(),
    })
}
