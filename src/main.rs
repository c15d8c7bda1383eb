//! # QuizForge CLI (`qf`)
//!
//! The `qf` binary drives the full question workflow: database setup,
//! source ingestion, retrieval inspection, question generation, and rating.
//!
//! ## Usage
//!
//! ```bash
//! qf --config ./config/qf.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qf init` | Create the SQLite database and run schema migrations |
//! | `qf ingest <files...>` | Ingest UTF-8 text files (form feed = page break) |
//! | `qf search "<query>"` | Show the top-ranked passages for a query |
//! | `qf gen <yn\|mcq>` | Generate and store questions |
//! | `qf rate <id> <score>` | Rate a question (1-10) and adjust weights |
//! | `qf fingerprint <kind> <stem>` | Print the content fingerprint (debug aid) |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use quizforge::models::{PageSet, Question, QuestionKind};
use quizforge::{completion, config, db, dedupe, embedding, feedback, ingest, migrate, ranker};

/// QuizForge CLI — retrieval-grounded exam question generation.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/qf.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "qf",
    about = "QuizForge — retrieval-grounded exam question generation",
    version,
    long_about = "QuizForge ingests documents into a SQLite corpus, retrieves relevant \
    passages with feedback-weighted ranking, and generates citation-backed yes/no and \
    multiple-choice exam questions through a validating LLM pipeline."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/qf.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent.
    Init,

    /// Ingest text files into the corpus.
    ///
    /// Files are read as UTF-8; form feed characters mark page breaks.
    /// A file whose content was already ingested is skipped.
    Ingest {
        /// Paths of the text files to ingest.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show the top-ranked passages for a query.
    ///
    /// Uses the configured embedding provider and the current chunk
    /// weights; useful for inspecting what generation would see.
    Search {
        /// The search query string.
        query: String,

        /// Number of passages to return.
        #[arg(short, long)]
        k: Option<i64>,
    },

    /// Generate and store questions.
    ///
    /// Retrieves passages for the topic, runs the generation pipeline,
    /// deduplicates by fingerprint, and persists the results. With the
    /// completion provider disabled, deterministic fallback questions are
    /// produced instead.
    Gen {
        /// Question kind: `yn` (yes/no) or `mcq` (multiple choice).
        kind: String,

        /// Topic used as the retrieval query and stored in metadata.
        #[arg(long)]
        topic: Option<String>,

        /// Difficulty label stored in metadata and mentioned in prompts.
        #[arg(long)]
        difficulty: Option<String>,

        /// Number of questions to request. Batches may come up short when
        /// the corpus cannot yield enough unique questions.
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Override the completion provider from config
        /// (disabled, openai, ollama).
        #[arg(long)]
        provider: Option<String>,
    },

    /// Rate a stored question on a 1-10 scale.
    ///
    /// Appends a rating and nudges the retrieval weights of the chunks on
    /// the pages the question cited.
    Rate {
        /// Question id (UUID printed by `gen`).
        question_id: String,

        /// Score from 1 (poor) to 10 (excellent); clamped.
        score: i64,

        /// Optional free-text feedback stored with the rating.
        #[arg(long)]
        feedback: Option<String>,
    },

    /// Print the content fingerprint of a question (debug aid).
    Fingerprint {
        /// Question kind: `yn` or `mcq`.
        kind: String,

        /// The question stem.
        stem: String,

        /// Options, in order (multiple choice only).
        options: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { files } => {
            run_ingest(&cfg, &files).await?;
        }
        Commands::Search { query, k } => {
            run_search(&cfg, &query, k).await?;
        }
        Commands::Gen {
            kind,
            topic,
            difficulty,
            count,
            provider,
        } => {
            run_gen(
                &cfg,
                &kind,
                topic.as_deref(),
                difficulty.as_deref(),
                count,
                provider.as_deref(),
            )
            .await?;
        }
        Commands::Rate {
            question_id,
            score,
            feedback,
        } => {
            let pool = db::connect(&cfg).await?;
            let outcome = feedback::record_rating(
                &pool,
                &question_id,
                score,
                feedback.as_deref(),
                cfg.feedback.gain,
            )
            .await?;
            println!(
                "Recorded score {} for {} ({} chunks adjusted by {:+.3}).",
                outcome.score, question_id, outcome.chunks_updated, outcome.delta
            );
        }
        Commands::Fingerprint {
            kind,
            stem,
            options,
        } => {
            let kind = QuestionKind::parse(&kind)?;
            println!("{}", dedupe::fingerprint(kind, &stem, &options));
        }
    }

    Ok(())
}

async fn run_ingest(cfg: &config::Config, files: &[PathBuf]) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let provider = embedding::create_provider(&cfg.embedding)?;

    let mut sources: Vec<PageSet> = Vec::with_capacity(files.len());
    for path in files {
        sources.push(ingest::read_text_file(path)?);
    }

    let stats = ingest::ingest_pages(&pool, provider.as_ref(), cfg.embedding.batch_size, &sources)
        .await?;

    for s in &stats {
        if s.skipped {
            println!("{}: already ingested, skipped.", s.filename);
        } else {
            println!("{}: {} chunks ingested.", s.filename, s.chunks);
        }
    }
    Ok(())
}

async fn run_search(cfg: &config::Config, query: &str, k: Option<i64>) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let provider = embedding::create_provider(&cfg.embedding)?;
    let mut ranker = ranker::Ranker::new(pool, provider);

    let k = k.unwrap_or(cfg.retrieval.default_k).max(1) as usize;
    let passages = ranker.search(query, k).await?;

    if passages.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, p) in passages.iter().enumerate() {
        println!(
            "{}. [{:.4}] [{}|p.{}] {}",
            i + 1,
            p.score,
            p.source,
            p.page,
            p.quote
        );
    }
    Ok(())
}

async fn run_gen(
    cfg: &config::Config,
    kind: &str,
    topic: Option<&str>,
    difficulty: Option<&str>,
    count: u32,
    provider_override: Option<&str>,
) -> Result<()> {
    let kind = QuestionKind::parse(kind)?;
    let pool = db::connect(cfg).await?;

    let embed_provider = embedding::create_provider(&cfg.embedding)?;
    let mut ranker = ranker::Ranker::new(pool.clone(), embed_provider);
    let query = topic.unwrap_or("general");
    let passages = ranker
        .search(query, cfg.retrieval.default_k.max(1) as usize)
        .await?;

    let mut completion_cfg = cfg.completion.clone();
    if let Some(name) = provider_override {
        completion_cfg.provider = name.to_string();
    }
    let completion = completion::create_provider(&completion_cfg)?;

    let batch = dedupe::generate_batch(
        &pool,
        completion.as_ref(),
        &cfg.generation,
        &passages,
        kind,
        topic,
        difficulty,
        count,
    )
    .await?;

    if batch.is_empty() {
        println!("No unique questions could be generated.");
        return Ok(());
    }

    for stored in &batch {
        print_question(stored);
        println!();
    }
    println!(
        "Stored {} of {} requested question(s).",
        batch.len(),
        count
    );
    Ok(())
}

fn print_question(stored: &quizforge::models::StoredQuestion) {
    let q = &stored.generated;
    println!("id: {}", stored.id);
    println!("kind: {}", q.question.kind().as_str());
    println!("stem: {}", q.question.stem());

    if let Question::MultipleChoice { options, .. } = &q.question {
        for (i, option) in options.iter().enumerate() {
            let letter = (b'a' + i as u8) as char;
            println!("  {}) {}", letter, option);
        }
    }

    println!("answer: {}", q.question.answer_str());
    println!("explanation: {}", q.question.explanation().render());

    if let Some(fb) = &q.fallback {
        println!("fallback: {}", fb.reason);
    }
}
