//! # Tagsim
//!
//! A per-tag document-similarity index engine with a cancellable,
//! crash-recoverable background-job substrate.
//!
//! Tagsim builds, for each tag of a corpus, bounded ranked lists of similar
//! documents. A service walks a simple lifecycle: `Prepare` extracts per-tag
//! word statistics into artifact files, `Activate` pins them (plus weighted
//! dictionaries) in memory behind a memory guard, `Index` computes the full
//! similarity graph, and `IndexPartial` keeps it consistent as documents
//! change. Every long-running step is a durable, observable, cancellable
//! process.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────┐   ┌─────────────┐
//! │ Document   │──▶│  Pipelines     │──▶│  SQLite      │
//! │ store      │   │ Prepare/Index │   │ edges+state │
//! └────────────┘   └──────┬────────┘   └──────┬──────┘
//!                         │                   │
//!                  ┌──────▼──────┐     ┌──────▼──────┐
//!                  │ Activation  │     │ Recommend   │
//!                  │ cache       │────▶│ queries     │
//!                  └─────────────┘     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Crate-wide error type |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`store`] | Durable service and process rows |
//! | [`process`] | Background-job orchestrator |
//! | [`scorer`] | Dictionary weighting and text scoring |
//! | [`docstore`] | External document store contract |
//! | [`simstore`] | Bounded sorted neighbor lists |
//! | [`artifacts`] | Per-tag subset files on disk |
//! | [`cache`] | Activation cache and memory guard |
//! | [`engine`] | Facade tying everything together |
//! | `prepare` | Subset extraction |
//! | `activate` | Loading subsets into the cache |
//! | `index` | Full similarity build |
//! | `index_partial` | Incremental maintenance |
//! | [`recommend`] | Recommendation queries |
//! | `export` | Dictionary export |

pub mod artifacts;
pub mod cache;
pub mod config;
pub mod db;
pub mod docstore;
pub mod engine;
pub mod error;
pub mod migrate;
pub mod models;
pub mod process;
pub mod scorer;
pub mod simstore;
pub mod store;

mod activate;
mod export;
mod index;
mod index_partial;
mod prepare;
pub mod recommend;
