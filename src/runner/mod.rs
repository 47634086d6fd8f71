//! Resumable loop execution.

pub mod budget;
pub mod context;
pub mod continuation;
pub mod error;
pub mod executor;

pub use budget::ExecutionBudget;
pub use context::ExecutionContext;
pub use continuation::{Continuation, ContinuationSink, StdoutSink};
pub use error::{ItemError, LoopError};
pub use executor::{ItemOperation, ItemOutcome, LoopExecutor, LoopOutcome, LoopPolicy};
