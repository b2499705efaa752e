//! Local-first sync layer for a personal media tracker.
//!
//! [`Tracker`] is the entry point: it routes every operation to the remote
//! API or the local store depending on connectivity, and [`Reconciler`]
//! brings the two back in line.

pub mod config;
pub mod error;
pub mod models;
pub mod probe;
pub mod remote;
pub mod session;
pub mod store;
pub mod sync;
pub mod tracker;

pub use config::Config;
pub use error::{Error, Result};
pub use models::{ConsumptionState, Media, MediaDraft, MediaType, MediaWithUserData, User, UserMediaState};
pub use session::Session;
pub use store::MediaRef;
pub use sync::{Reconciler, SyncOutcome, SyncReport};
pub use tracker::Tracker;
