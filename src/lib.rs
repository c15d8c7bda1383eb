//! # QuizForge
//!
//! A retrieval-grounded exam question generator.
//!
//! QuizForge ingests pre-extracted documents into a SQLite corpus, retrieves
//! the most relevant passages for a topic with feedback-weighted cosine
//! ranking, and drives an LLM through a validate-and-repair pipeline to
//! produce citation-backed yes/no and multiple-choice questions. Every
//! accepted question carries exactly one `[source|p.N]` citation tag, is
//! deduplicated by content fingerprint, and can be rated to steer future
//! retrieval toward well-received material.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │  Ingest  │──▶│ Chunk+Embed  │──▶│  SQLite   │
//! │ (pages)  │   │              │   │  corpus   │
//! └──────────┘   └──────────────┘   └────┬─────┘
//!                                        │
//!                  ┌─────────────────────┤
//!                  ▼                     ▼
//!           ┌────────────┐        ┌────────────┐
//!           │   Ranker   │───────▶│  Generate  │
//!           │ (weighted) │        │ + Dedupe   │
//!           └─────▲──────┘        └─────┬──────┘
//!                 │      ratings        │
//!                 └──── Feedback ◀──────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! qf init                        # create database
//! qf ingest notes.txt            # ingest a text source
//! qf search "shortest paths"     # inspect retrieval
//! qf gen mcq --topic graphs      # generate a question
//! qf rate <id> 8                 # reward the cited pages
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`chunk`] | Text chunking |
//! | [`ingest`] | Source ingestion |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`completion`] | Text completion provider abstraction |
//! | [`ranker`] | Weighted semantic retrieval |
//! | [`textutil`] | Citation tags, snippets, JSON extraction |
//! | [`generate`] | Generation pipeline with validation and fallback |
//! | [`dedupe`] | Fingerprinting and batch generation |
//! | [`feedback`] | Rating-driven weight adjustment |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod completion;
pub mod config;
pub mod db;
pub mod dedupe;
pub mod embedding;
pub mod feedback;
pub mod generate;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod ranker;
pub mod textutil;
