//! Tessera - locking and commit-consistency core of a clustered transactional data grid.
//!
//! Tessera decides, for every cache operation, which keys must be locked, on
//! which node, and for how long, and then whether and how the resulting value
//! is written into local storage. It covers non-transactional, optimistic and
//! pessimistic locking, and five cache modes (local, invalidation,
//! replicated, distributed with an optional near-cache, scattered).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Cache (core::runtime)                       │
//! │   contexts │ write routing │ transaction completion shipping    │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 LockingInterceptor (locking)                    │
//! │  skip │ clear │ L1 invalidation │ release on commit/rollback    │
//! │        NonTx │ Optimistic │ Pessimistic  strategies             │
//! │        LockingPolicy │ lock table │ pending-operation barrier   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     CommitStage (commit)                        │
//! │  OrderedCommitLogic (per-key ordering, passivation)             │
//! │  ClusteringDependentLogic (Local │ Invalidation │ Replication   │
//! │                            Distribution │ Scattered)            │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Collaborators: topology oracle │ RPC │ data container │ store │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Two-phase cache construction and routing
//! - [`core::error`] - Error types and classification
//! - [`core::ids`] - Keys and identifiers
//!
//! ## Control
//! - [`control::topology`] - Segment ownership and the shared topology lock
//! - [`control::rpc`] - Remote invocation and partition handling
//!
//! ## Locking
//! - [`locking::interceptor`] - Command entry point
//! - [`locking::policy`] - Shared lock operations
//! - [`locking::optimistic`], [`locking::pessimistic`], [`locking::non_tx`] - Strategies
//! - [`locking::barrier`] - Pending-operation barrier
//!
//! ## Commit
//! - [`commit::logic`] - Clustering-dependent commit logic
//! - [`commit::ordered`] - Commit ordering decorator
//! - [`commit::write_skew`] - Write-skew detection
//!
//! # Key Invariants
//!
//! - At most one node holds the real lock on a key: its primary owner.
//! - A non-transactional command holds no lock once it returns.
//! - A topology-retry failure never releases locks.
//! - Listeners fire only for authoritative commits, after storage completes.
//! - Commits to one key are applied in the order they were requested.

// Core infrastructure
pub mod core;

// Cluster collaborators
pub mod control;

// Locking layer
pub mod locking;

// Commit path
pub mod commit;

// Re-exports for convenience
pub use self::core::{config, error, runtime, telemetry};
pub use self::core::config::Config;
pub use self::core::error::{GridError, GridResult};
pub use self::core::runtime::{Cache, CacheBuilder, Collaborators};
