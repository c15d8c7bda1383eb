use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Create sources table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filename TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            pages INTEGER NOT NULL,
            imported_at TEXT NOT NULL,
            UNIQUE(content_hash)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create chunks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            page INTEGER NOT NULL,
            text TEXT NOT NULL,
            quote TEXT NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (source_id) REFERENCES sources(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create chunk_weights table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_weights (
            chunk_id INTEGER PRIMARY KEY,
            weight REAL NOT NULL DEFAULT 0,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create questions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS questions (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            stem TEXT NOT NULL,
            options TEXT,
            answer TEXT NOT NULL,
            explanation TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            fingerprint TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(fingerprint)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create question_citations table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS question_citations (
            question_id TEXT NOT NULL,
            source_id INTEGER NOT NULL,
            page INTEGER NOT NULL,
            quote TEXT NOT NULL,
            FOREIGN KEY (question_id) REFERENCES questions(id),
            FOREIGN KEY (source_id) REFERENCES sources(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create ratings table (append-only)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ratings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            question_id TEXT NOT NULL,
            score INTEGER NOT NULL,
            feedback TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (question_id) REFERENCES questions(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source_id ON chunks(source_id)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source_page ON chunks(source_id, page)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_citations_question_id ON question_citations(question_id)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ratings_question_id ON ratings(question_id)")
        .execute(&pool)
        .await?;

    backfill_content_hashes(&pool).await?;

    pool.close().await;
    Ok(())
}

/// Databases created before the content-hash column carry empty hashes.
/// Recompute them from the stored chunk text so duplicate-import detection
/// works for legacy rows too.
async fn backfill_content_hashes(pool: &SqlitePool) -> Result<()> {
    let rows = sqlx::query("SELECT id FROM sources WHERE content_hash = ''")
        .fetch_all(pool)
        .await?;

    for row in rows {
        let source_id: i64 = row.get("id");
        let chunk_rows =
            sqlx::query("SELECT text FROM chunks WHERE source_id = ? ORDER BY page, id")
                .bind(source_id)
                .fetch_all(pool)
                .await?;

        let mut hasher = Sha256::new();
        for chunk_row in &chunk_rows {
            let text: String = chunk_row.get("text");
            hasher.update(text.as_bytes());
        }
        let hash = format!("{:x}", hasher.finalize());

        sqlx::query("UPDATE sources SET content_hash = ? WHERE id = ?")
            .bind(&hash)
            .bind(source_id)
            .execute(pool)
            .await?;
    }

    Ok(())
}
