//! Ingestion pipeline orchestration.
//!
//! Coordinates the corpus-build flow: page tuples → content hashing →
//! chunking → batch embedding → storage. Format extraction happens upstream;
//! ingestion receives [`PageSet`]s of already-extracted page text. Importing
//! a source whose content hash is already present is a benign skip, not an
//! error.

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::Path;

use crate::chunk::{chunk_text, DEFAULT_MAX_CHARS, DEFAULT_OVERLAP};
use crate::embedding::{vec_to_blob, EmbeddingProvider};
use crate::models::PageSet;
use crate::textutil::{truncate_chars, SNIPPET_MAX_CHARS};

/// Per-source ingestion outcome.
#[derive(Debug, Clone)]
pub struct IngestStats {
    pub filename: String,
    pub chunks: usize,
    pub skipped: bool,
}

/// Ingest pre-extracted sources into the corpus.
///
/// For each source: hash the page text, skip when the hash already exists,
/// otherwise insert the source row, chunk every page, embed the chunk texts
/// in `batch_size` batches, and write chunk rows inside one transaction.
pub async fn ingest_pages(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    batch_size: usize,
    sources: &[PageSet],
) -> Result<Vec<IngestStats>> {
    let mut stats = Vec::with_capacity(sources.len());

    for source in sources {
        let content_hash = hash_pages(&source.pages);

        let inserted = sqlx::query(
            r#"
            INSERT INTO sources (filename, content_hash, pages, imported_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(content_hash) DO NOTHING
            "#,
        )
        .bind(&source.filename)
        .bind(&content_hash)
        .bind(source.pages.len() as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;

        if inserted.rows_affected() == 0 {
            stats.push(IngestStats {
                filename: source.filename.clone(),
                chunks: 0,
                skipped: true,
            });
            continue;
        }

        let source_id = inserted.last_insert_rowid();

        // Chunk every page, keeping the page number with each chunk.
        let mut pending: Vec<(i64, String, String)> = Vec::new();
        for (page_index, page_text) in source.pages.iter().enumerate() {
            let page = page_index as i64 + 1;
            for chunk in chunk_text(page_text, DEFAULT_MAX_CHARS, DEFAULT_OVERLAP) {
                let quote = truncate_chars(&chunk, SNIPPET_MAX_CHARS);
                pending.push((page, chunk, quote));
            }
        }

        let texts: Vec<String> = pending.iter().map(|(_, text, _)| text.clone()).collect();
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size.max(1)) {
            embeddings.extend(provider.embed_many(batch).await?);
        }

        let mut tx = pool.begin().await?;
        for ((page, text, quote), embedding) in pending.iter().zip(embeddings.iter()) {
            sqlx::query(
                "INSERT INTO chunks (source_id, page, text, quote, embedding) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(source_id)
            .bind(page)
            .bind(text)
            .bind(quote)
            .bind(vec_to_blob(embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        stats.push(IngestStats {
            filename: source.filename.clone(),
            chunks: pending.len(),
            skipped: false,
        });
    }

    Ok(stats)
}

/// Content hash over all pages, in order.
pub fn hash_pages(pages: &[String]) -> String {
    let mut hasher = Sha256::new();
    for page in pages {
        hasher.update(page.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Read a UTF-8 text file as a [`PageSet`], splitting pages on form feeds.
///
/// Files without form feeds become a single-page source.
pub fn read_text_file(path: &Path) -> Result<PageSet> {
    let content = std::fs::read_to_string(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let pages: Vec<String> = content.split('\u{c}').map(str::to_string).collect();

    Ok(PageSet { filename, pages })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DbConfig, EmbeddingConfig};
    use crate::embedding::HashedProvider;
    use crate::migrate;
    use sqlx::Row;
    use tempfile::TempDir;

    fn provider() -> HashedProvider {
        HashedProvider::new(&EmbeddingConfig {
            provider: "hashed".to_string(),
            model: Some("fnv-tf".to_string()),
            dims: Some(64),
            ..EmbeddingConfig::default()
        })
        .unwrap()
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

    fn page_set(filename: &str, pages: &[&str]) -> PageSet {
        PageSet {
            filename: filename.to_string(),
            pages: pages.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_ingest_writes_source_and_chunks() {
        let (_tmp, pool) = setup().await;
        let provider = provider();
        let sources = vec![page_set(
            "notes.pdf",
            &[
                "Shannon entropy measures average information content per symbol.",
                "A graph is bipartite iff it contains no odd cycle.",
            ],
        )];

        let stats = ingest_pages(&pool, &provider, 64, &sources).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert!(!stats[0].skipped);
        assert_eq!(stats[0].chunks, 2);

        let pages: i64 = sqlx::query_scalar("SELECT pages FROM sources WHERE filename = 'notes.pdf'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(pages, 2);

        let rows = sqlx::query("SELECT page, text, quote, embedding FROM chunks ORDER BY page")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let page: i64 = rows[0].get("page");
        assert_eq!(page, 1);
        let blob: Vec<u8> = rows[0].get("embedding");
        assert_eq!(blob.len(), 64 * 4);
        let quote: String = rows[1].get("quote");
        assert!(quote.starts_with("A graph is bipartite"));
    }

    #[tokio::test]
    async fn test_duplicate_content_skipped() {
        let (_tmp, pool) = setup().await;
        let provider = provider();
        let sources = vec![page_set("a.pdf", &["Identical page content here."])];

        let first = ingest_pages(&pool, &provider, 64, &sources).await.unwrap();
        assert!(!first[0].skipped);

        // Same content under a different filename still collides on hash.
        let again = vec![page_set("b.pdf", &["Identical page content here."])];
        let second = ingest_pages(&pool, &provider, 64, &again).await.unwrap();
        assert!(second[0].skipped);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_long_page_produces_overlapping_chunks() {
        let (_tmp, pool) = setup().await;
        let provider = provider();
        let long_page = "The minimum spanning tree connects all vertices at least cost. "
            .repeat(40);
        let sources = vec![page_set("long.pdf", &[&long_page])];

        let stats = ingest_pages(&pool, &provider, 8, &sources).await.unwrap();
        assert!(stats[0].chunks > 1);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count as usize, stats[0].chunks);
    }

    #[test]
    fn test_hash_pages_sensitive_to_boundaries() {
        let a = hash_pages(&["ab".to_string(), "c".to_string()]);
        let b = hash_pages(&["a".to_string(), "bc".to_string()]);
        assert_ne!(a, b);
        assert_eq!(a, hash_pages(&["ab".to_string(), "c".to_string()]));
    }

    #[test]
    fn test_read_text_file_splits_form_feeds() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.txt");
        std::fs::write(&path, "page one\u{c}page two\u{c}page three").unwrap();
        let set = read_text_file(&path).unwrap();
        assert_eq!(set.filename, "doc.txt");
        assert_eq!(set.pages.len(), 3);
        assert_eq!(set.pages[1], "page two");
    }
}
