//! # Triage Harness
//!
//! An evidence-grounded incident triage assistant for operations teams.
//!
//! Triage Harness ingests network and security events, scores them for
//! anomaly risk, retrieves semantically similar historical incidents from
//! a vector index, assembles a bounded context from that retrieval plus
//! live cluster signals, and generates a natural-language remediation
//! recommendation delivered through a chat channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌───────────┐
//! │  Events   │──▶│  Scorer  │──▶│ Assembler │──▶│ Generator │
//! └──────────┘   └──────────┘   │ (retrieve │   └─────┬─────┘
//! ┌──────────┐   ┌──────────┐   │ + cluster │         ▼
//! │ Operator │──▶│  Intent  │──▶│  signals) │   ┌───────────┐
//! │ messages │   │  parser  │   └─────┬─────┘   │  Notifier │
//! └──────────┘   └──────────┘         │         └───────────┘
//!                               ┌─────┴─────┐
//!                               │  SQLite   │
//!                               │ store+vec │
//!                               └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! triage init                                # create database
//! triage ingest --source ids "disk full on node-3"
//! triage ask "how do I fix the disk full alert on node-3?"
//! triage search "node-3 storage alert"
//! triage serve                               # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`embedding`] | Embedding encoder backends |
//! | [`index`] | In-memory nearest-neighbor index |
//! | [`store`] | Deduplicated incident store |
//! | [`scorer`] | Anomaly risk scoring |
//! | [`intent`] | Operator-message intent parsing |
//! | [`cluster`] | Cluster state adapter |
//! | [`context`] | Bounded context assembly |
//! | [`generate`] | Recommendation generation |
//! | [`notify`] | Chat delivery and callback verification |
//! | [`pipeline`] | The assembled assistant |
//! | [`server`] | HTTP serving layer |

pub mod cluster;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generate;
pub mod index;
pub mod intent;
pub mod migrate;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod scorer;
pub mod server;
pub mod store;
