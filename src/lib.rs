//! resumable-importer: bulk import of graph-shaped content archives in
//! resumable, checkpointed chunks.
//!
//! Every loop over archive items records each committed item in a durable
//! per-session document. A run that runs out of time (or is interrupted)
//! suspends at an item boundary and hands back a continuation; re-running
//! the same session resumes after the last committed item. Forward
//! references between entities are settled in backfill passes once the
//! creation pass has finished.

#![warn(clippy::all)]

pub mod content;
pub mod import;
pub mod retry;
pub mod runner;
pub mod state;
