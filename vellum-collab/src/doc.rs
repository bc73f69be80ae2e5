//! Document and step contracts.
//!
//! The sync machinery is generic over the edited data. A document type plugs
//! in by implementing [`SyncDoc`]; its edit type implements [`Step`]. The
//! contract is small on purpose:
//!
//! - `apply` is pure: it returns a new document and never mutates in place,
//!   so rejected batches leave no trace.
//! - every step can produce its inverse relative to the document it was
//!   applied to, which is what lets a client undo optimistic local edits
//!   before folding in remote ones.
//! - adjacent steps may merge, collapsing bursts of typing into fewer wire
//!   steps.
//!
//! Versions are plain counters: version N means N steps were applied since
//! the document instance was created. A version is only meaningful relative
//! to the instance that minted it.

use std::fmt;

use uuid::Uuid;

/// Monotonic step counter of a document instance.
pub type Version = u64;

/// An atomic edit of a document of type `D`.
pub trait Step<D>: Clone + fmt::Debug + Send + Sync + 'static {
    /// The inverse step, computed against the document this step was applied
    /// to. Applying the result to `before.apply(self)` restores `before`.
    fn invert(&self, before: &D) -> Self;

    /// Try to collapse `self` followed by `next` into one step. Returns
    /// `None` when the pair is not adjacent in a mergeable way.
    fn merge(&self, next: &Self) -> Option<Self>;
}

/// A document that can be edited collaboratively.
pub trait SyncDoc: Clone + fmt::Debug + Send + Sync + Sized + 'static {
    type Step: Step<Self>;

    /// Apply a step, producing the successor document. Fails when the step
    /// does not fit the current state; the receiver is left untouched.
    fn apply(&self, step: &Self::Step) -> Result<Self, ApplyError>;

    /// Content size in the document's own units. Drives the client's detach
    /// ceiling.
    fn size(&self) -> usize;

    /// Serialized form for snapshot storage.
    fn to_persistable(&self) -> Vec<u8>;

    /// Rebuild from [`SyncDoc::to_persistable`] output.
    fn from_persistable(bytes: &[u8]) -> Result<Self, PersistError>;

    /// The document a never-before-seen name starts from.
    fn initial() -> Self;
}

/// A step accepted into an instance's log, stamped with the editing client
/// so that client can recognize its own work when it pulls.
#[derive(Debug, Clone)]
pub struct CommittedStep<D: SyncDoc> {
    pub step: D::Step,
    pub client_id: Uuid,
}

/// A step did not fit the document it was applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyError {
    message: String,
}

impl ApplyError {
    pub fn new(message: impl Into<String>) -> Self {
        ApplyError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step does not apply: {}", self.message)
    }
}

impl std::error::Error for ApplyError {}

/// A persisted snapshot could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistError {
    message: String,
}

impl PersistError {
    pub fn new(message: impl Into<String>) -> Self {
        PersistError {
            message: message.into(),
        }
    }
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot decode failed: {}", self.message)
    }
}

impl std::error::Error for PersistError {}
