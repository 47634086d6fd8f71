//! Durable session state.
//!
//! One JSON document per import session, stored in SQLite and addressed by
//! dot-separated paths. On top of the raw store sit the per-item checkpoint
//! bookkeeping used by the loop executor and the (normally disabled)
//! session housekeeping sweeps.

pub mod checkpoint;
pub mod error;
pub mod housekeeping;
pub mod path;
pub mod schema;
pub mod store;
pub mod types;

pub use checkpoint::CheckpointTracker;
pub use error::StateError;
pub use housekeeping::{Housekeeper, BATCH_ID_KEY};
pub use store::{SessionDocument, SessionStore, SqliteSessionStore, UPDATED_AT_KEY};
pub use types::{HousekeepingReport, SessionSummary, SkipRecord};
