//! Authoritative state for a single document.
//!
//! An instance owns the document, its version counter, and a bounded log of
//! recently committed steps. The version is the number of steps ever applied;
//! the log keeps only the most recent [`ManagerConfig::step_history`] of
//! them, so a reader too far behind is told to reload instead of being fed a
//! gap.
//!
//! Pushes are transactional: a batch is applied to a scratch copy first and
//! committed only if every step lands, so a rejected batch leaves no partial
//! state behind. Accepting a batch wakes all parked long-pollers.
//!
//! Presence is tracked as a set of user ids with debounced collection: the
//! first registration after a quiet period asks the caller to schedule a
//! sweep, the sweep keeps whoever is still parked on a waiter, and it asks
//! to run again while anyone remains.
//!
//! [`ManagerConfig::step_history`]: crate::config::ManagerConfig

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::{Instant, SystemTime};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::doc::{ApplyError, CommittedStep, SyncDoc, Version};
use crate::protocol::DocName;
use crate::storage::PersistedDoc;

/// Steps after a given version, plus the presence count at read time.
#[derive(Debug)]
pub struct DocEvents<D: SyncDoc> {
    pub steps: Vec<CommittedStep<D>>,
    pub users: usize,
}

/// Why a push was refused.
#[derive(Debug)]
pub enum AddError {
    /// Claimed version is ahead of the instance. The client is talking about
    /// a different instance's history.
    InvalidVersion { requested: Version, current: Version },
    /// Claimed version is behind the head; the pusher must catch up first.
    Outdated { requested: Version, current: Version },
    /// A step in the batch did not apply; nothing was committed.
    StepFailed(ApplyError),
    /// The instance was stopped (evicted) while the request was in flight.
    Stopped,
}

impl fmt::Display for AddError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddError::InvalidVersion { requested, current } => {
                write!(f, "version {requested} ahead of document head {current}")
            }
            AddError::Outdated { requested, current } => {
                write!(f, "version {requested} behind document head {current}")
            }
            AddError::StepFailed(e) => write!(f, "step rejected: {e}"),
            AddError::Stopped => write!(f, "document instance stopped"),
        }
    }
}

impl std::error::Error for AddError {}

/// Why a read could not be served.
#[derive(Debug)]
pub enum HistoryError {
    InvalidVersion { requested: Version, current: Version },
    Unavailable { requested: Version, oldest: Version },
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryError::InvalidVersion { requested, current } => {
                write!(f, "version {requested} ahead of document head {current}")
            }
            HistoryError::Unavailable { requested, oldest } => {
                write!(f, "history from {requested} foreclosed, oldest retained is {oldest}")
            }
        }
    }
}

impl std::error::Error for HistoryError {}

struct Waiter {
    id: u64,
    user_id: Uuid,
    wake: oneshot::Sender<()>,
}

pub struct DocumentInstance<D: SyncDoc> {
    name: DocName,
    doc: D,
    version: Version,
    steps: VecDeque<CommittedStep<D>>,
    step_history: usize,
    users: HashSet<Uuid>,
    collecting: bool,
    waiting: Vec<Waiter>,
    next_waiter: u64,
    last_active: Instant,
    created: SystemTime,
    dirty: bool,
    stopped: bool,
}

impl<D: SyncDoc> DocumentInstance<D> {
    pub fn new(name: DocName, doc: D, created: SystemTime, step_history: usize) -> Self {
        DocumentInstance {
            name,
            doc,
            version: 0,
            steps: VecDeque::new(),
            step_history,
            users: HashSet::new(),
            collecting: false,
            waiting: Vec::new(),
            next_waiter: 0,
            last_active: Instant::now(),
            created,
            dirty: false,
            stopped: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &D {
        &self.doc
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Append a batch of steps claimed against `version`. All-or-nothing:
    /// on any failure the document, version, and log are untouched.
    pub fn add_events(
        &mut self,
        version: Version,
        steps: Vec<D::Step>,
        client_id: Uuid,
    ) -> Result<Version, AddError> {
        if self.stopped {
            return Err(AddError::Stopped);
        }
        self.touch();
        if version > self.version {
            return Err(AddError::InvalidVersion {
                requested: version,
                current: self.version,
            });
        }
        if version < self.version {
            return Err(AddError::Outdated {
                requested: version,
                current: self.version,
            });
        }

        let mut doc = self.doc.clone();
        let mut committed = Vec::with_capacity(steps.len());
        for step in steps {
            doc = doc.apply(&step).map_err(AddError::StepFailed)?;
            committed.push(CommittedStep { step, client_id });
        }

        self.doc = doc;
        self.version += committed.len() as u64;
        self.steps.extend(committed);
        while self.steps.len() > self.step_history {
            self.steps.pop_front();
        }
        self.dirty = true;
        self.wake_waiters();
        Ok(self.version)
    }

    /// Steps committed after `since`, oldest first. An empty result means the
    /// reader is already at the head.
    pub fn events_since(&self, since: Version) -> Result<DocEvents<D>, HistoryError> {
        if since > self.version {
            return Err(HistoryError::InvalidVersion {
                requested: since,
                current: self.version,
            });
        }
        let oldest = self.version - self.steps.len() as u64;
        if since < oldest {
            return Err(HistoryError::Unavailable {
                requested: since,
                oldest,
            });
        }
        let skip = (since - oldest) as usize;
        Ok(DocEvents {
            steps: self.steps.iter().skip(skip).cloned().collect(),
            users: self.user_count(),
        })
    }

    /// Record `user_id` as present. Returns true when the caller should
    /// schedule a presence collection pass; at most one pass is pending at a
    /// time.
    pub fn register_user(&mut self, user_id: Uuid) -> bool {
        self.touch();
        self.users.insert(user_id);
        if self.collecting {
            return false;
        }
        self.collecting = true;
        true
    }

    /// Presence collection pass: only users still parked on a waiter count
    /// as present. Returns true when another pass should be scheduled.
    pub fn collect_users(&mut self) -> bool {
        self.collecting = false;
        if self.stopped {
            self.users.clear();
            return false;
        }
        self.users.clear();
        for waiter in &self.waiting {
            self.users.insert(waiter.user_id);
        }
        if self.users.is_empty() {
            false
        } else {
            self.collecting = true;
            true
        }
    }

    /// Park a long-poller. The receiver fires when new steps commit or the
    /// instance stops.
    pub fn add_waiter(&mut self, user_id: Uuid) -> (u64, oneshot::Receiver<()>) {
        let (wake, rx) = oneshot::channel();
        let id = self.next_waiter;
        self.next_waiter += 1;
        self.waiting.push(Waiter { id, user_id, wake });
        (id, rx)
    }

    /// Drop a parked waiter, typically after its poll timed out.
    pub fn remove_waiter(&mut self, id: u64) {
        self.waiting.retain(|w| w.id != id);
    }

    fn wake_waiters(&mut self) {
        for waiter in self.waiting.drain(..) {
            let _ = waiter.wake.send(());
        }
    }

    /// Mark the instance as gone. Wakes every waiter so parked polls return
    /// promptly; later pushes are refused.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.wake_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag, reporting whether it was set.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Re-mark unsaved changes, e.g. after a failed store write.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn snapshot(&self) -> PersistedDoc {
        PersistedDoc::with_created(self.doc.to_persistable(), self.created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::{TextDoc, TextStep};

    fn instance(history: usize) -> DocumentInstance<TextDoc> {
        DocumentInstance::new(
            "doc".to_string(),
            TextDoc::initial(),
            SystemTime::now(),
            history,
        )
    }

    fn client() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn test_push_appends_and_advances_version() {
        let mut inst = instance(100);
        let author = client();
        let version = inst
            .add_events(
                0,
                vec![TextStep::insert(0, "he"), TextStep::insert(2, "y")],
                author,
            )
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(inst.version(), 2);
        assert_eq!(inst.doc().text(), "hey");

        let events = inst.events_since(0).unwrap();
        assert_eq!(events.steps.len(), 2);
        assert!(events.steps.iter().all(|s| s.client_id == author));
    }

    #[test]
    fn test_version_ahead_is_invalid() {
        let mut inst = instance(100);
        let err = inst
            .add_events(5, vec![TextStep::insert(0, "x")], client())
            .unwrap_err();
        assert!(matches!(err, AddError::InvalidVersion { requested: 5, current: 0 }));
    }

    #[test]
    fn test_stale_version_is_outdated() {
        let mut inst = instance(100);
        inst.add_events(0, vec![TextStep::insert(0, "a")], client())
            .unwrap();
        let err = inst
            .add_events(0, vec![TextStep::insert(0, "b")], client())
            .unwrap_err();
        assert!(matches!(err, AddError::Outdated { requested: 0, current: 1 }));
    }

    #[test]
    fn test_failed_step_rejects_whole_batch() {
        let mut inst = instance(100);
        inst.add_events(
            0,
            vec![TextStep::insert(0, "a"), TextStep::insert(1, "b")],
            client(),
        )
        .unwrap();

        let err = inst
            .add_events(
                2,
                vec![TextStep::insert(2, "c"), TextStep::insert(99, "d")],
                client(),
            )
            .unwrap_err();
        assert!(matches!(err, AddError::StepFailed(_)));
        assert_eq!(inst.version(), 2);
        assert_eq!(inst.doc().text(), "ab");
        assert_eq!(inst.events_since(0).unwrap().steps.len(), 2);
    }

    #[test]
    fn test_events_since_partial_read() {
        let mut inst = instance(100);
        for i in 0..3 {
            inst.add_events(i, vec![TextStep::insert(i as usize, "x")], client())
                .unwrap();
        }
        assert_eq!(inst.events_since(1).unwrap().steps.len(), 2);
        assert!(inst.events_since(3).unwrap().steps.is_empty());
    }

    #[test]
    fn test_events_since_ahead_is_invalid() {
        let inst = instance(100);
        assert!(matches!(
            inst.events_since(1),
            Err(HistoryError::InvalidVersion { requested: 1, current: 0 })
        ));
    }

    #[test]
    fn test_ring_forecloses_old_history() {
        let mut inst = instance(2);
        for i in 0..5u64 {
            inst.add_events(i, vec![TextStep::insert(i as usize, "x")], client())
                .unwrap();
        }
        assert!(matches!(
            inst.events_since(0),
            Err(HistoryError::Unavailable { requested: 0, oldest: 3 })
        ));
        assert!(matches!(
            inst.events_since(2),
            Err(HistoryError::Unavailable { .. })
        ));
        assert_eq!(inst.events_since(3).unwrap().steps.len(), 2);
        assert_eq!(inst.events_since(5).unwrap().steps.len(), 0);
    }

    #[test]
    fn test_commit_wakes_waiters() {
        let mut inst = instance(100);
        let (_, mut rx) = inst.add_waiter(client());
        assert_eq!(inst.waiter_count(), 1);

        inst.add_events(0, vec![TextStep::insert(0, "x")], client())
            .unwrap();
        assert_eq!(inst.waiter_count(), 0);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_remove_waiter() {
        let mut inst = instance(100);
        let (id, _rx) = inst.add_waiter(client());
        inst.remove_waiter(id);
        assert_eq!(inst.waiter_count(), 0);
    }

    #[test]
    fn test_stop_wakes_waiters_and_refuses_pushes() {
        let mut inst = instance(100);
        let (_, mut rx) = inst.add_waiter(client());
        inst.stop();
        assert!(rx.try_recv().is_ok());
        assert!(matches!(
            inst.add_events(0, vec![TextStep::insert(0, "x")], client()),
            Err(AddError::Stopped)
        ));
    }

    #[test]
    fn test_register_user_schedules_collection_once() {
        let mut inst = instance(100);
        assert!(inst.register_user(client()));
        assert!(!inst.register_user(client()));
        assert_eq!(inst.user_count(), 2);
    }

    #[test]
    fn test_collect_users_keeps_parked_users() {
        let mut inst = instance(100);
        let present = client();
        let gone = client();
        inst.register_user(present);
        inst.register_user(gone);
        let (waiter, _rx) = inst.add_waiter(present);

        assert!(inst.collect_users());
        assert_eq!(inst.user_count(), 1);

        inst.remove_waiter(waiter);
        assert!(!inst.collect_users());
        assert_eq!(inst.user_count(), 0);
    }

    #[test]
    fn test_rejected_batch_leaves_waiters_parked() {
        let mut inst = instance(100);
        let (_, mut rx) = inst.add_waiter(client());
        let _ = inst.add_events(7, vec![TextStep::insert(0, "x")], client());
        assert_eq!(inst.waiter_count(), 1);
        assert!(rx.try_recv().is_err());
    }
}
