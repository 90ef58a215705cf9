//! Commit path.
//!
//! Everything between "the command was admitted under its locks" and "the
//! value is in local storage":
//! - [`logic`] - per cache-mode commit decision and storage write
//! - [`ordered`] - per-key ordering of commits, passivation and activation
//! - [`write_skew`] - version checks for versioned transactions
//! - [`tracker`] - state-transfer conflict tracking
//! - [`notifier`] - listener dispatch for committed writes
//! - [`container`] - in-memory storage and the persistence seam
//! - [`stage`] - the terminal command stage

pub mod container;
pub mod decision;
pub mod entry;
pub mod logic;
pub mod notifier;
pub mod ordered;
pub mod stage;
pub mod tracker;
pub mod write_skew;
