//! Document lifecycle management and request routing.
//!
//! The manager owns every live [`DocumentInstance`] and serializes their
//! creation: the instance map's lock is held across the snapshot load, so two
//! racing requests for an unknown name produce exactly one instance, and it
//! is held across eviction writes, so a racing lookup finds either the live
//! instance or its finished snapshot — never the gap between them. Each
//! instance then serializes its own operations behind its own lock, and the
//! manager never holds an instance lock while parked on a long poll.
//!
//! ```text
//!   get_document ──►┌───────────────┐   lookup-or-create (serialized)
//!   get_events   ──►│ CollabManager │──► DocumentInstance (per-doc lock)
//!   push_events  ──►└───────┬───────┘
//!                           │ NewVersion broadcasts, debounced saves,
//!                           ▼ idle sweep, LRU eviction
//! ```
//!
//! Lifecycle policy:
//! - pulls at the head are parked on the instance and woken by the next
//!   accepted push, up to [`ManagerConfig::long_poll_timeout`];
//! - a background sweep evicts instances nobody is using, always leaving at
//!   least one alive;
//! - exceeding [`ManagerConfig::max_instances`] evicts the
//!   least-recently-active instance, persisting it first if dirty;
//! - accepted pushes schedule a debounced snapshot write per document.
//!
//! The manager's `id` is its epoch. Versions minted by one epoch are
//! meaningless to another, so pulls and pushes carrying a foreign epoch are
//! answered with [`FailureKind::InvalidVersion`], which sends the client back
//! through a full load.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5
//! (leader-based replication; all writes funnel through one authority).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Instant, SystemTime};

use futures_util::future::join_all;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::doc::{SyncDoc, Version};
use crate::protocol::{CollabNotice, DocName, FailureKind};
use crate::server::instance::{AddError, DocEvents, DocumentInstance, HistoryError};
use crate::storage::{SnapshotStore, StoreError};

type SharedInstance<D> = Arc<Mutex<DocumentInstance<D>>>;

#[derive(Default)]
struct AtomicStats {
    loads: AtomicU64,
    pulls: AtomicU64,
    pushes_accepted: AtomicU64,
    pushes_rejected: AtomicU64,
    instances_created: AtomicU64,
    evictions: AtomicU64,
    saves: AtomicU64,
}

/// Point-in-time view of the manager's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub loads: u64,
    pub pulls: u64,
    pub pushes_accepted: u64,
    pub pushes_rejected: u64,
    pub instances_created: u64,
    pub evictions: u64,
    pub saves: u64,
}

pub struct CollabManager<D: SyncDoc> {
    id: Uuid,
    config: ManagerConfig,
    store: Arc<dyn SnapshotStore>,
    instances: Mutex<HashMap<DocName, SharedInstance<D>>>,
    updates: broadcast::Sender<CollabNotice>,
    save_pending: StdMutex<HashSet<DocName>>,
    stats: AtomicStats,
}

impl<D: SyncDoc> CollabManager<D> {
    /// Start a manager with a fresh epoch. Must be called inside a tokio
    /// runtime; the idle sweeper starts immediately and stops when the last
    /// handle is dropped.
    pub fn new(config: ManagerConfig, store: Arc<dyn SnapshotStore>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(256);
        let manager = Arc::new(CollabManager {
            id: Uuid::new_v4(),
            config,
            store,
            instances: Mutex::new(HashMap::new()),
            updates,
            save_pending: StdMutex::new(HashSet::new()),
            stats: AtomicStats::default(),
        });
        Self::spawn_sweeper(&manager);
        log::info!("collab manager {} started", manager.id);
        manager
    }

    fn spawn_sweeper(manager: &Arc<Self>) {
        let weak = Arc::downgrade(manager);
        let interval = manager.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sweep_idle().await;
            }
        });
    }

    /// This manager's epoch id, echoed to clients on every load.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receiver for `NewVersion` announcements.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<CollabNotice> {
        self.updates.subscribe()
    }

    /// Current document plus the version and presence count at read time.
    pub async fn get_document(
        &self,
        name: &str,
        user_id: Uuid,
    ) -> Result<(D, Version, usize), FailureKind> {
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        let instance = self
            .lookup_or_create(name, user_id, !self.config.create_on_missing)
            .await?;
        let guard = instance.lock().await;
        Ok((guard.doc().clone(), guard.version(), guard.user_count()))
    }

    /// Steps committed after `since`. When the reader is already at the head
    /// the call parks until new steps arrive or the long-poll window lapses,
    /// then returns (possibly empty) without error.
    pub async fn get_events(
        &self,
        name: &str,
        since: Version,
        user_id: Uuid,
        manager_id: Uuid,
    ) -> Result<DocEvents<D>, FailureKind> {
        self.stats.pulls.fetch_add(1, Ordering::Relaxed);
        self.check_epoch(manager_id)?;
        let instance = self.lookup_or_create(name, user_id, false).await?;

        let (waiter, woken) = {
            let mut guard = instance.lock().await;
            match guard.events_since(since) {
                Ok(events) if !events.steps.is_empty() => return Ok(events),
                Ok(_) => {}
                Err(e) => return Err(history_failure(name, e)),
            }
            guard.add_waiter(user_id)
        };

        let fired = timeout(self.config.long_poll_timeout, woken).await;
        let mut guard = instance.lock().await;
        match fired {
            Ok(Ok(())) if !guard.is_stopped() => {
                guard.events_since(since).map_err(|e| history_failure(name, e))
            }
            Ok(_) => Ok(DocEvents {
                steps: Vec::new(),
                users: guard.user_count(),
            }),
            Err(_) => {
                guard.remove_waiter(waiter);
                Ok(DocEvents {
                    steps: Vec::new(),
                    users: guard.user_count(),
                })
            }
        }
    }

    /// Submit a batch of steps against `version`. On success every parked
    /// poller is woken, a `NewVersion` announcement goes out, and a debounced
    /// snapshot write is scheduled.
    pub async fn push_events(
        self: &Arc<Self>,
        name: &str,
        version: Version,
        steps: Vec<D::Step>,
        client_id: Uuid,
        user_id: Uuid,
        manager_id: Uuid,
    ) -> Result<Version, FailureKind> {
        self.check_epoch(manager_id)?;
        let instance = self.lookup_or_create(name, user_id, false).await?;
        let outcome = {
            let mut guard = instance.lock().await;
            guard.add_events(version, steps, client_id)
        };
        match outcome {
            Ok(new_version) => {
                self.stats.pushes_accepted.fetch_add(1, Ordering::Relaxed);
                log::debug!("'{name}' advanced to version {new_version}");
                let _ = self.updates.send(CollabNotice::NewVersion {
                    doc_name: name.to_string(),
                    version: new_version,
                });
                self.schedule_save(name);
                Ok(new_version)
            }
            Err(e) => {
                self.stats.pushes_rejected.fetch_add(1, Ordering::Relaxed);
                Err(push_failure(name, e))
            }
        }
    }

    /// Load every stored document into a live instance, e.g. at process
    /// start. Existing instances are left alone.
    pub async fn preload(&self) -> Result<usize, StoreError> {
        let names = self.store.list()?;
        let mut loaded = 0;
        for name in names {
            let mut instances = self.instances.lock().await;
            if instances.contains_key(&name) {
                continue;
            }
            let Some(snapshot) = self.store.load(&name)? else {
                continue;
            };
            let doc = match D::from_persistable(&snapshot.doc) {
                Ok(doc) => doc,
                Err(e) => {
                    log::warn!("skipping undecodable snapshot '{name}': {e}");
                    continue;
                }
            };
            if instances.len() >= self.config.max_instances {
                self.evict_oldest(&mut instances).await;
            }
            instances.insert(
                name.clone(),
                Arc::new(Mutex::new(DocumentInstance::new(
                    name.clone(),
                    doc,
                    snapshot.created(),
                    self.config.step_history,
                ))),
            );
            self.stats.instances_created.fetch_add(1, Ordering::Relaxed);
            loaded += 1;
        }
        log::info!("preloaded {loaded} documents from storage");
        Ok(loaded)
    }

    /// Persist every dirty instance. Called before dropping the manager when
    /// pending debounced writes must not be lost.
    pub async fn shutdown(&self) {
        let entries: Vec<(DocName, SharedInstance<D>)> = {
            let instances = self.instances.lock().await;
            instances
                .iter()
                .map(|(name, instance)| (name.clone(), Arc::clone(instance)))
                .collect()
        };
        let flushes = entries
            .iter()
            .map(|(name, instance)| self.persist_instance(name, instance));
        join_all(flushes).await;
        log::info!("manager {} flushed {} instances", self.id, entries.len());
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    pub async fn has_instance(&self, name: &str) -> bool {
        self.instances.lock().await.contains_key(name)
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            loads: self.stats.loads.load(Ordering::Relaxed),
            pulls: self.stats.pulls.load(Ordering::Relaxed),
            pushes_accepted: self.stats.pushes_accepted.load(Ordering::Relaxed),
            pushes_rejected: self.stats.pushes_rejected.load(Ordering::Relaxed),
            instances_created: self.stats.instances_created.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            saves: self.stats.saves.load(Ordering::Relaxed),
        }
    }

    fn check_epoch(&self, manager_id: Uuid) -> Result<(), FailureKind> {
        if manager_id == self.id {
            Ok(())
        } else {
            log::warn!(
                "request carried stale manager epoch {manager_id}, current is {}",
                self.id
            );
            Err(FailureKind::InvalidVersion)
        }
    }

    async fn lookup_or_create(
        &self,
        name: &str,
        user_id: Uuid,
        require_stored: bool,
    ) -> Result<SharedInstance<D>, FailureKind> {
        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(name) {
            let existing = Arc::clone(existing);
            drop(instances);
            self.register(&existing, user_id).await;
            return Ok(existing);
        }

        // First sighting. The map lock stays held across the store read so a
        // concurrent request for the same name finds this instance instead of
        // creating a second one.
        let persisted = match self.store.load(name) {
            Ok(found) => found,
            Err(e) => {
                log::error!("snapshot load for '{name}' failed: {e}");
                None
            }
        };
        if require_stored && persisted.is_none() {
            return Err(FailureKind::DocumentNotFound);
        }
        let (doc, created) = match persisted {
            Some(snapshot) => match D::from_persistable(&snapshot.doc) {
                Ok(doc) => (doc, snapshot.created()),
                Err(e) => {
                    log::warn!("snapshot for '{name}' undecodable, starting fresh: {e}");
                    (D::initial(), SystemTime::now())
                }
            },
            None => (D::initial(), SystemTime::now()),
        };

        if instances.len() >= self.config.max_instances {
            self.evict_oldest(&mut instances).await;
        }
        let instance = Arc::new(Mutex::new(DocumentInstance::new(
            name.to_string(),
            doc,
            created,
            self.config.step_history,
        )));
        instances.insert(name.to_string(), Arc::clone(&instance));
        self.stats.instances_created.fetch_add(1, Ordering::Relaxed);
        log::info!("opened document instance '{name}'");
        drop(instances);

        self.register(&instance, user_id).await;
        Ok(instance)
    }

    /// Remove, stop, and persist the least-recently-active instance. Runs
    /// under the caller's map lock: the snapshot must reach the store before
    /// any lookup can see the name missing, or a racing request would rebuild
    /// the document from a stale read.
    async fn evict_oldest(&self, instances: &mut HashMap<DocName, SharedInstance<D>>) {
        let mut oldest: Option<(DocName, Instant)> = None;
        for (name, instance) in instances.iter() {
            let idle_since = instance.lock().await.last_active();
            match &oldest {
                Some((_, t)) if *t <= idle_since => {}
                _ => oldest = Some((name.clone(), idle_since)),
            }
        }
        let Some((name, _)) = oldest else { return };
        let Some(instance) = instances.remove(&name) else { return };
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        log::info!("evicting least-recently-active document '{name}'");
        instance.lock().await.stop();
        self.persist_instance(&name, &instance).await;
    }

    async fn register(&self, instance: &SharedInstance<D>, user_id: Uuid) {
        let schedule = {
            let mut guard = instance.lock().await;
            guard.register_user(user_id)
        };
        if schedule {
            self.spawn_presence_collector(Arc::clone(instance));
        }
    }

    fn spawn_presence_collector(&self, instance: SharedInstance<D>) {
        let window = self.config.presence_timeout;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(window).await;
                let again = instance.lock().await.collect_users();
                if !again {
                    break;
                }
            }
        });
    }

    fn schedule_save(self: &Arc<Self>, name: &str) {
        {
            let mut pending = self.pending();
            if !pending.insert(name.to_string()) {
                return;
            }
        }
        let weak = Arc::downgrade(self);
        let name = name.to_string();
        let delay = self.config.save_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else { return };
            manager.flush(&name).await;
        });
    }

    async fn flush(&self, name: &str) {
        self.pending().remove(name);
        let instance = { self.instances.lock().await.get(name).cloned() };
        // An instance evicted meanwhile was persisted by the eviction.
        let Some(instance) = instance else { return };
        self.persist_instance(name, &instance).await;
    }

    async fn persist_instance(&self, name: &str, instance: &SharedInstance<D>) -> bool {
        let snapshot = {
            let mut guard = instance.lock().await;
            if !guard.take_dirty() {
                return true;
            }
            guard.snapshot()
        };
        match self.store.save(name, &snapshot) {
            Ok(()) => {
                self.stats.saves.fetch_add(1, Ordering::Relaxed);
                log::debug!("persisted '{name}'");
                true
            }
            Err(e) => {
                log::error!("persisting '{name}' failed: {e}");
                instance.lock().await.mark_dirty();
                false
            }
        }
    }

    /// Evict instances nobody is using. At least one instance is always left
    /// alive so the most recent document stays warm. The map lock is held
    /// through each snapshot write, like [`Self::evict_oldest`], so the
    /// swept name never looks missing while its write is still in flight.
    async fn sweep_idle(&self) {
        let mut instances = self.instances.lock().await;
        if instances.len() <= 1 {
            return;
        }
        let mut idle = Vec::new();
        for (name, instance) in instances.iter() {
            if instance.lock().await.user_count() == 0 {
                idle.push(name.clone());
            }
        }
        let mut swept = 0;
        for name in idle {
            if instances.len() <= 1 {
                break;
            }
            let Some(instance) = instances.remove(&name) else { continue };
            instance.lock().await.stop();
            self.persist_instance(&name, &instance).await;
            log::info!("swept idle document '{name}'");
            swept += 1;
        }
        if swept > 0 {
            self.stats.evictions.fetch_add(swept, Ordering::Relaxed);
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<DocName>> {
        self.save_pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn history_failure(name: &str, e: HistoryError) -> FailureKind {
    match e {
        HistoryError::InvalidVersion { .. } => {
            log::warn!("pull for '{name}' rejected: {e}");
            FailureKind::InvalidVersion
        }
        HistoryError::Unavailable { .. } => {
            log::debug!("pull for '{name}': {e}");
            FailureKind::HistoryNotAvailable
        }
    }
}

fn push_failure(name: &str, e: AddError) -> FailureKind {
    match e {
        AddError::InvalidVersion { .. } => {
            log::warn!("push to '{name}' rejected: {e}");
            FailureKind::InvalidVersion
        }
        AddError::Outdated { .. } => {
            log::debug!("push to '{name}' outdated: {e}");
            FailureKind::OutdatedVersion
        }
        AddError::StepFailed(_) => {
            log::warn!("push to '{name}' rejected: {e}");
            FailureKind::OutdatedVersion
        }
        AddError::Stopped => {
            log::debug!("push to stopped instance '{name}'");
            FailureKind::OutdatedVersion
        }
    }
}
