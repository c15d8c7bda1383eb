//! Retrieval ranker: weighted cosine ranking over the chunk corpus.
//!
//! The ranker owns an in-process cache of the decoded chunk matrix plus
//! metadata, so large corpora are not re-decoded on every call. A cheap
//! `COUNT(*)` probe before each search invalidates and rebuilds the cache
//! whenever the corpus size changed; that full rebuild is the only
//! permitted cache mutation. Multiple rankers over distinct pools can
//! coexist in one process.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::embedding::{self, EmbeddingProvider};
use crate::models::Passage;

/// Lower bound of the feedback multiplier `1 + weight`.
pub const MIN_MULTIPLIER: f64 = 0.25;
/// Upper bound of the feedback multiplier `1 + weight`.
pub const MAX_MULTIPLIER: f64 = 2.50;

struct CacheEntry {
    chunk_id: i64,
    source_id: i64,
    page: i64,
    text: String,
    quote: String,
    embedding: Vec<f32>,
    weight: f64,
}

struct RankerCache {
    chunk_count: i64,
    entries: Vec<CacheEntry>,
    source_names: HashMap<i64, String>,
}

/// Ranks corpus passages against a query embedding, boosted or suppressed
/// by per-chunk feedback weights.
pub struct Ranker {
    pool: SqlitePool,
    provider: Box<dyn EmbeddingProvider>,
    cache: Option<RankerCache>,
}

impl Ranker {
    pub fn new(pool: SqlitePool, provider: Box<dyn EmbeddingProvider>) -> Self {
        Self {
            pool,
            provider,
            cache: None,
        }
    }

    /// Drop the cached chunk matrix; the next search rebuilds it.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Search the corpus for the `k` most relevant passages.
    ///
    /// Effective score is `dot(query, chunk) × clamp(1 + weight, 0.25, 2.50)`;
    /// both vectors are unit-normalized, so the dot product is cosine
    /// similarity. Results are sorted descending by effective score; ties
    /// keep stable relative order. An empty corpus yields an empty vec.
    pub async fn search(&mut self, query: &str, k: usize) -> Result<Vec<Passage>> {
        self.refresh_cache().await?;
        let cache = self.cache.as_ref().unwrap();

        if cache.entries.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = embedding::embed_query(self.provider.as_ref(), query).await?;

        let mut scored: Vec<(usize, f64)> = cache
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let sim = dot(&query_vec, &entry.embedding) as f64;
                let multiplier = (1.0 + entry.weight).clamp(MIN_MULTIPLIER, MAX_MULTIPLIER);
                (i, sim * multiplier)
            })
            .collect();

        // sort_by is stable: equal scores keep corpus load order.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        let results = scored
            .into_iter()
            .map(|(i, score)| {
                let entry = &cache.entries[i];
                Passage {
                    chunk_id: entry.chunk_id,
                    source_id: entry.source_id,
                    source: cache
                        .source_names
                        .get(&entry.source_id)
                        .cloned()
                        .unwrap_or_default(),
                    page: entry.page,
                    quote: entry.quote.clone(),
                    text: entry.text.clone(),
                    score,
                }
            })
            .collect();

        Ok(results)
    }

    /// Rebuild the cache when the chunk count changed since the last build.
    async fn refresh_cache(&mut self) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;

        if let Some(cache) = &self.cache {
            if cache.chunk_count == count {
                return Ok(());
            }
        }

        let rows = sqlx::query(
            r#"
            SELECT c.id, c.source_id, c.page, c.text, c.quote, c.embedding,
                   COALESCE(w.weight, 0.0) AS weight
            FROM chunks c
            LEFT JOIN chunk_weights w ON w.chunk_id = c.id
            ORDER BY c.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        let mut dims: Option<usize> = None;

        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let vec = embedding::blob_to_vec(&blob);

            match dims {
                None => dims = Some(vec.len()),
                Some(d) if d != vec.len() => {
                    let chunk_id: i64 = row.get("id");
                    bail!(
                        "Chunk {} has embedding dimension {} but the corpus uses {}",
                        chunk_id,
                        vec.len(),
                        d
                    );
                }
                _ => {}
            }

            entries.push(CacheEntry {
                chunk_id: row.get("id"),
                source_id: row.get("source_id"),
                page: row.get("page"),
                text: row.get("text"),
                quote: row.get("quote"),
                embedding: vec,
                weight: row.get("weight"),
            });
        }

        let source_rows = sqlx::query("SELECT id, filename FROM sources")
            .fetch_all(&self.pool)
            .await?;
        let source_names: HashMap<i64, String> = source_rows
            .iter()
            .map(|row| (row.get("id"), row.get("filename")))
            .collect();

        self.cache = Some(RankerCache {
            chunk_count: count,
            entries,
            source_names,
        });

        Ok(())
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DbConfig, EmbeddingConfig};
    use crate::embedding::{vec_to_blob, HashedProvider};
    use crate::migrate;
    use tempfile::TempDir;

    const DIMS: usize = 128;

    fn hashed_provider() -> Box<dyn EmbeddingProvider> {
        let config = EmbeddingConfig {
            provider: "hashed".to_string(),
            model: Some("fnv-tf".to_string()),
            dims: Some(DIMS),
            ..EmbeddingConfig::default()
        };
        Box::new(HashedProvider::new(&config).unwrap())
    }

    async fn setup() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            db: DbConfig {
                path: tmp.path().join("qf.sqlite"),
            },
            retrieval: Default::default(),
            embedding: Default::default(),
            completion: Default::default(),
            generation: Default::default(),
            feedback: Default::default(),
        };
        migrate::run_migrations(&config).await.unwrap();
        let pool = crate::db::connect(&config).await.unwrap();
        (tmp, pool)
    }

    async fn insert_source(pool: &SqlitePool, filename: &str) -> i64 {
        sqlx::query(
            "INSERT INTO sources (filename, content_hash, pages, imported_at) VALUES (?, ?, 1, datetime('now'))",
        )
        .bind(filename)
        .bind(format!("hash-{filename}"))
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    async fn insert_chunk(pool: &SqlitePool, source_id: i64, page: i64, text: &str) -> i64 {
        let provider = hashed_provider();
        let vecs = provider.embed_many(&[text.to_string()]).await.unwrap();
        sqlx::query(
            "INSERT INTO chunks (source_id, page, text, quote, embedding) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(source_id)
        .bind(page)
        .bind(text)
        .bind(text)
        .bind(vec_to_blob(&vecs[0]))
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    async fn set_weight(pool: &SqlitePool, chunk_id: i64, weight: f64) {
        sqlx::query(
            "INSERT INTO chunk_weights (chunk_id, weight) VALUES (?, ?)
             ON CONFLICT(chunk_id) DO UPDATE SET weight = excluded.weight",
        )
        .bind(chunk_id)
        .bind(weight)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_empty_corpus_returns_empty() {
        let (_tmp, pool) = setup().await;
        let mut ranker = Ranker::new(pool, hashed_provider());
        let results = ranker.search("anything", 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_results_sorted_and_capped() {
        let (_tmp, pool) = setup().await;
        let sid = insert_source(&pool, "A.pdf").await;
        insert_chunk(&pool, sid, 1, "Entropy quantifies uncertainty in a random variable.").await;
        insert_chunk(&pool, sid, 2, "Graph coloring assigns labels to vertices.").await;
        insert_chunk(&pool, sid, 3, "Entropy of a uniform distribution is maximal.").await;

        let mut ranker = Ranker::new(pool, hashed_provider());
        let results = ranker.search("entropy uncertainty", 2).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].score >= results[1].score);
        assert_eq!(results[0].source, "A.pdf");
    }

    #[tokio::test]
    async fn test_single_chunk_score_is_raw_similarity() {
        let (_tmp, pool) = setup().await;
        let sid = insert_source(&pool, "A.pdf").await;
        insert_chunk(&pool, sid, 3, "X is true.").await;

        let mut ranker = Ranker::new(pool, hashed_provider());
        let results = ranker.search("X", 5).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "A.pdf");
        assert_eq!(results[0].page, 3);
        // weight = 0 → multiplier = 1 → score equals raw cosine similarity,
        // which for unit vectors stays within [-1, 1].
        assert!(results[0].score.abs() <= 1.0 + 1e-9);
    }

    #[tokio::test]
    async fn test_weight_boosts_equal_similarity_chunks() {
        let (_tmp, pool) = setup().await;
        let sid = insert_source(&pool, "A.pdf").await;
        // Identical text → identical similarity; only the weight differs.
        let boosted = insert_chunk(&pool, sid, 1, "The same factual sentence.").await;
        let plain = insert_chunk(&pool, sid, 2, "The same factual sentence.").await;
        set_weight(&pool, boosted, 0.5).await;

        let mut ranker = Ranker::new(pool, hashed_provider());
        let results = ranker.search("factual sentence", 2).await.unwrap();

        assert_eq!(results[0].chunk_id, boosted);
        assert_eq!(results[1].chunk_id, plain);
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn test_negative_weight_suppresses() {
        let (_tmp, pool) = setup().await;
        let sid = insert_source(&pool, "A.pdf").await;
        let suppressed = insert_chunk(&pool, sid, 1, "The same factual sentence.").await;
        let plain = insert_chunk(&pool, sid, 2, "The same factual sentence.").await;
        set_weight(&pool, suppressed, -0.5).await;

        let mut ranker = Ranker::new(pool, hashed_provider());
        let results = ranker.search("factual sentence", 2).await.unwrap();

        assert_eq!(results[0].chunk_id, plain);
    }

    #[tokio::test]
    async fn test_multiplier_clamped() {
        // A weight beyond the multiplier range must not score more than
        // the 2.5× bound allows.
        let (_tmp, pool) = setup().await;
        let sid = insert_source(&pool, "A.pdf").await;
        let a = insert_chunk(&pool, sid, 1, "The same factual sentence.").await;
        let b = insert_chunk(&pool, sid, 2, "The same factual sentence.").await;
        set_weight(&pool, a, 9.0).await; // multiplier clamps to 2.5
        set_weight(&pool, b, 1.5).await; // exactly the 2.5 bound

        let mut ranker = Ranker::new(pool, hashed_provider());
        let results = ranker.search("factual sentence", 2).await.unwrap();
        assert!((results[0].score - results[1].score).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_corpus_growth() {
        let (_tmp, pool) = setup().await;
        let sid = insert_source(&pool, "A.pdf").await;
        insert_chunk(&pool, sid, 1, "Original chunk about entropy and information.").await;

        let mut ranker = Ranker::new(pool.clone(), hashed_provider());
        let first = ranker.search("entropy", 10).await.unwrap();
        assert_eq!(first.len(), 1);

        insert_chunk(&pool, sid, 2, "A second chunk about entropy arrives later.").await;
        let second = ranker.search("entropy", 10).await.unwrap();
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let (_tmp, pool) = setup().await;
        let sid = insert_source(&pool, "A.pdf").await;
        insert_chunk(&pool, sid, 1, "Normal chunk with the shared dimensionality.").await;
        // Insert a chunk with a wrong-sized vector directly.
        sqlx::query(
            "INSERT INTO chunks (source_id, page, text, quote, embedding) VALUES (?, 2, 'bad', 'bad', ?)",
        )
        .bind(sid)
        .bind(vec_to_blob(&vec![0.5f32; 7]))
        .execute(&pool)
        .await
        .unwrap();

        let mut ranker = Ranker::new(pool, hashed_provider());
        assert!(ranker.search("anything", 5).await.is_err());
    }
}
