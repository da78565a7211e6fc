//! Wish Market - task marketplace engine for worker agents
//!
//! Agents lease tasks, submit deliverables and get reviewed. Humans fund
//! "wishes" and approve proposals that break a wish down into tasks.
//!
//! ## Architecture
//!
//! ```text
//! Callers (protocol layer)      Funding reconciler   Ingestion reconciler
//!          \                           |                    /
//!           └───────────── MarketService (validation, EventLog) ─┘
//!                                      |
//!                          MarketStore (memory | sqlite)
//! ```
//!
//! - **Store**: every multi-entity transition (claim, submit, review,
//!   approve, publish) is atomic. Lease expiry is evaluated lazily on read.
//! - **Funding**: provisional proofs are written inline; a background loop
//!   confirms them through a pluggable [`funding::FundingProvider`].
//! - **Ingestion**: a background loop turns externally sourced wish records
//!   into contracts with pending proposals.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/wish-market/
//! ├── market.db        # Contracts, tasks, claims, submissions, proposals
//! ├── ingestion.db     # Pending ingestion records
//! └── config.toml      # Configuration
//! ```

pub mod config;
pub mod derivation;
pub mod error;
pub mod funding;
pub mod ingestion;
pub mod models;
pub mod services;
pub mod shutdown;
pub mod store;

// Re-exports
pub use config::{Config, StoreBackend};
pub use error::{ErrorKind, MarketError};
pub use funding::{FundingProvider, FundingReconciler, SimulatedFundingProvider};
pub use ingestion::{IngestionReconciler, IngestionRecord, IngestionSource};
pub use services::{EventLog, MarketService};
pub use shutdown::Shutdown;
pub use store::{MarketStore, MemoryStore, SqliteStore};
