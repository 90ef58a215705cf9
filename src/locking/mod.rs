//! Locking layer.
//!
//! - [`interceptor`] - command entry point and the strategy seam
//! - [`policy`] - lock operations shared by the strategies
//! - [`non_tx`], [`optimistic`], [`pessimistic`] - one strategy per transaction mode
//! - [`lock_table`] - per-key exclusive locks
//! - [`barrier`] - waits for transactions from older topologies
//! - [`transaction`], [`tx_table`], [`context`] - transaction and invocation state
//! - [`command`] - the commands flowing through the chain

pub mod barrier;
pub mod command;
pub mod context;
pub mod interceptor;
pub mod lock_table;
pub mod non_tx;
pub mod optimistic;
pub mod pessimistic;
pub mod policy;
pub mod transaction;
pub mod tx_table;
