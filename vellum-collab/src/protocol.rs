//! Request/response vocabulary spoken between clients and a manager.
//!
//! Everything rides the bus as a [`CollabPayload`]: requests travel in pings
//! to the manager's address, responses come back in the correlated pongs, and
//! [`CollabNotice`] values are broadcast to everyone.
//!
//! ```text
//!   GetDocument ──► Document { doc, version, users, manager_id }
//!   PullEvents  ──► Events   { steps, users }        (may long-poll)
//!   PushEvents  ──► Pushed                           (or Failure)
//! ```
//!
//! `manager_id` is the manager's epoch: versions are only meaningful against
//! the instance that minted them, so pulls and pushes carry the id from the
//! load they are based on, and a manager that does not recognize it answers
//! [`FailureKind::InvalidVersion`] to force a clean reload.

use uuid::Uuid;

use crate::doc::{CommittedStep, SyncDoc, Version};

/// Name a document is addressed by.
pub type DocName = String;

#[derive(Debug, Clone)]
pub enum CollabRequest<D: SyncDoc> {
    /// Load the current document, creating it if the manager allows that.
    GetDocument { doc_name: DocName, user_id: Uuid },
    /// Ask for steps after `version`. Held open server-side when nothing is
    /// newer yet.
    PullEvents {
        doc_name: DocName,
        version: Version,
        user_id: Uuid,
        manager_id: Uuid,
    },
    /// Submit steps produced against `version`.
    PushEvents {
        doc_name: DocName,
        version: Version,
        steps: Vec<D::Step>,
        client_id: Uuid,
        user_id: Uuid,
        manager_id: Uuid,
    },
}

#[derive(Debug, Clone)]
pub enum CollabResponse<D: SyncDoc> {
    Document {
        doc: D,
        version: Version,
        users: usize,
        manager_id: Uuid,
    },
    Events {
        steps: Vec<CommittedStep<D>>,
        users: usize,
    },
    Pushed,
    Failure(FailureKind),
}

/// Why the manager refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The document does not exist and creation was not permitted.
    DocumentNotFound,
    /// The presented version is ahead of the instance, or was minted by a
    /// different manager epoch. Unrecoverable without a fresh load.
    InvalidVersion,
    /// The presented version is behind the instance head. Pull first, then
    /// retry.
    OutdatedVersion,
    /// The step log no longer reaches back to the requested version.
    HistoryNotAvailable,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::DocumentNotFound => write!(f, "document not found"),
            FailureKind::InvalidVersion => write!(f, "version not valid for this document instance"),
            FailureKind::OutdatedVersion => write!(f, "version behind the document head"),
            FailureKind::HistoryNotAvailable => write!(f, "step history no longer available"),
        }
    }
}

/// Unsolicited announcements broadcast by a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollabNotice {
    /// A document advanced; pollers may want to pull now instead of sleeping.
    NewVersion { doc_name: DocName, version: Version },
}

/// Everything a collab bus carries.
#[derive(Debug, Clone)]
pub enum CollabPayload<D: SyncDoc> {
    Request(CollabRequest<D>),
    Response(CollabResponse<D>),
    Notice(CollabNotice),
}
