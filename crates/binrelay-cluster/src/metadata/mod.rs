//! Replicated configuration metadata
//!
//! Each entity kind (source, endpoint, pipeline) gets a
//! [`MetadataRepository`] that writes through the local cache to the remote
//! store and reconciles the cache against it:
//!
//! ```text
//!   cascade_*  ──▶ local txn (entity + intent) ──▶ remote conditional write ──▶ clear intent
//!
//!   refresh_*  ◀── remote {id, version} listing / change notification
//!                  orphaned ⇒ delete local, stale ⇒ fetch, never lower a version
//! ```

pub mod intent;
pub mod repository;

pub use intent::{Intent, IntentLog, IntentOp};
pub use repository::{
    ListFilter, MetadataRepository, RefreshOutcome, RefreshReport, ReplayReport, MAX_CAS_RETRIES,
};
