//! # Ragline
//!
//! A retrieval-augmented chat backend: document ingestion, embedding,
//! vector retrieval, and streaming completions over SQLite.
//!
//! Ragline turns uploaded documents into scoped, searchable context for
//! chat. Documents are chunked and embedded through an asynchronous job
//! queue, stored as vectors in SQLite, retrieved by cosine similarity at
//! chat time, and woven into a streaming completion relayed token by token
//! to the client.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌─────────────────┐   ┌───────────┐
//! │ Documents │──▶│  Job Queue       │──▶│  SQLite    │
//! │ (upload)  │   │ Chunk+Embed     │   │ vectors   │
//! └───────────┘   └─────────────────┘   └─────┬─────┘
//!                                             │
//!                  ┌──────────────────────────┤
//!                  ▼                          ▼
//!            ┌──────────┐              ┌──────────┐
//!            │   CLI    │              │   HTTP   │
//!            │(ragline) │              │ chat/SSE │
//!            └──────────┘              └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragline init                        # create database
//! ragline ingest ./notes.md --owner alice
//! ragline ask "what did my notes say?" --owner alice
//! ragline serve                       # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Vector storage and similarity queries |
//! | [`queue`] | Asynchronous ingestion job queue |
//! | [`ingest`] | Chunk → embed → store pipeline |
//! | [`retrieve`] | Best-effort chat-time retrieval |
//! | [`context`] | Context block assembly |
//! | [`relay`] | Streaming completion relay |
//! | [`server`] | HTTP API server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod relay;
pub mod retrieve;
pub mod server;
pub mod store;
