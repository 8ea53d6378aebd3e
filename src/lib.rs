//! # docparse
//!
//! Ingest documents, extract their text, and turn that text into structured
//! records shaped by a JSON schema, keeping every stage in SQLite.
//!
//! docparse is a three-stage pipeline. Documents are deduplicated by content
//! fingerprint and their text is extracted once; text rows can then be
//! structured, all at once or as a sample, by a language model constrained
//! to a schema. A document that fails at any stage is recorded as failed
//! and never stops the rest of the batch.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌───────────────────┐
//! │  Source   │──▶│ ContentStore │──▶│ {table}_metadata  │
//! │ directory │   │ hash+extract │   │ {table}_contents  │
//! └───────────┘   └──────────────┘   └─────────┬─────────┘
//!                                              │ TextRepository
//!                                              ▼
//!                 ┌──────────────┐   ┌───────────────────┐
//!   schema.json ─▶│ Structuring  │──▶│   {destination}   │
//!                 │ gate+LLM     │   │  (default _parsed)│
//!                 └──────────────┘   └───────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docparse extract --dir ./claims --table claims
//! docparse parse --schema member.json --origin claims_contents --destination claims_parsed --sample 10
//! docparse pipeline --dir ./claims --table claims --schema member.json
//! docparse stats --table claims
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`tables`] | Table naming and creation |
//! | [`models`] | Core data types |
//! | [`error`] | Run-level errors |
//! | [`scan`] | Source directory walking |
//! | [`extract`] | Text extraction from PDF and text files |
//! | [`content_store`] | Fingerprinted document intake |
//! | [`text_repository`] | Full and sampled reads of extracted text |
//! | [`schema`] | Structural schemas and their registry |
//! | [`completion`] | OpenAI and Ollama completion clients |
//! | [`gate`] | Rate-limited call gate |
//! | [`structuring`] | Text to schema-shaped value |
//! | [`records`] | Parsed-record persistence |
//! | [`pipeline`] | Extract, parse, and full-pipeline runs |
//! | [`progress`] | Progress reporting on stderr |
//! | [`stats`] | Collection statistics |
//! | [`get`] | Single-document inspection |
//! | [`check`] | Configuration and connectivity check |

pub mod check;
pub mod completion;
pub mod config;
pub mod content_store;
pub mod db;
pub mod error;
pub mod extract;
pub mod gate;
pub mod get;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod records;
pub mod scan;
pub mod schema;
pub mod stats;
pub mod structuring;
pub mod tables;
pub mod text_repository;
