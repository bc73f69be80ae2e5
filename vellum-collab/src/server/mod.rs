//! Authoritative side of the sync protocol: per-document instances and the
//! manager that routes requests to them.

pub mod instance;
pub mod manager;

pub use instance::{AddError, DocEvents, DocumentInstance, HistoryError};
pub use manager::{CollabManager, ManagerStats};
