//! Client-side sync engine.
//!
//! The engine owns a local replica of one document and runs a phase machine
//! that keeps it converging with the manager's authoritative copy:
//!
//! ```text
//!                 ┌────────────────── restart ──────────────────┐
//!                 ▼                                             │
//!   ┌───────┐  load   ┌──────┐  local edits   ┌──────┐  stale   │
//!   │ Start │ ───────►│ Poll │ ──────────────►│ Send │ ─────────┤
//!   └───────┘         └──┬───┘ ◄────────────── └──┬───┘          │
//!       │                │      pushed / raced    │   timeout    │
//!       │ too large      │ timeout        timeout │              │
//!       ▼                ▼                        ▼              │
//!   ┌──────────┐     ┌─────────┐  backoff lapsed                │
//!   │ Detached │     │ Recover │ ───────► Poll    history gone ─┘
//!   └──────────┘     └─────────┘
//! ```
//!
//! Edits apply locally first and queue as unconfirmed steps; the server's
//! acceptance (or their arrival at the head of a pull) confirms them. A pull
//! that returns foreign steps triggers a rebase: unconfirmed steps are
//! unwound via their stored inverses, the remote steps applied, and the
//! local ones replayed on top, dropping any that no longer fit. There is no
//! operational transform here; conflicts resolve by pull-then-retry, which
//! trades merge fidelity for a protocol simple enough to audit.
//!
//! One network request is in flight at a time. An in-flight pull is the only
//! cancelable one: a local edit drops it and switches to sending. Push
//! replies are never abandoned, and a push that times out after being
//! committed server-side heals on the next pull, when the engine finds its
//! own steps at the head and confirms them instead of re-applying. Until
//! that settles, the pushed steps stay pinned in the queue one entry per
//! step, and edits made in the meantime queue behind them.
//!
//! The engine runs as an owned task; [`EngineHandle`] is the way in, the
//! event channel the way out.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5
//! (replication lag and read-your-writes on the client side).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::comm::{ClientCommunication, CommError, LoadedDoc};
use crate::config::EngineConfig;
use crate::doc::{ApplyError, CommittedStep, Step, SyncDoc, Version};
use crate::protocol::FailureKind;
use crate::server::instance::DocEvents;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Loading the document from the manager.
    Start,
    /// Watching for remote steps.
    Poll,
    /// Submitting queued local steps.
    Send,
    /// Manager unreachable; waiting out a backoff.
    Recover,
    /// Document over the size ceiling; edits stay local.
    Detached,
    /// Unrecoverable protocol error; syncing stopped.
    Halted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Start => "start",
            Phase::Poll => "poll",
            Phase::Send => "send",
            Phase::Recover => "recover",
            Phase::Detached => "detached",
            Phase::Halted => "halted",
        };
        write!(f, "{name}")
    }
}

/// Notifications emitted while the engine runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Loaded { version: Version },
    /// Foreign steps were folded into the local doc.
    RemoteSteps { count: usize, version: Version },
    /// Local steps were acknowledged by the manager.
    Confirmed { count: usize, version: Version },
    Recovering { retry_in: Duration },
    Detached { size: usize },
    Restarted,
    StartFailed { reason: String },
    Halted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    /// No document loaded yet.
    NotReady,
    /// A step did not apply to the current local doc.
    Rejected(ApplyError),
    /// The engine task is gone.
    EngineGone,
}

impl fmt::Display for EditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditError::NotReady => write!(f, "no document loaded yet"),
            EditError::Rejected(e) => write!(f, "edit rejected: {e}"),
            EditError::EngineGone => write!(f, "sync engine stopped"),
        }
    }
}

impl std::error::Error for EditError {}

/// Point-in-time view of the engine, answered for any phase.
#[derive(Debug, Clone)]
pub struct EngineSnapshot<D: SyncDoc> {
    pub phase: Phase,
    pub doc: Option<D>,
    pub version: Version,
    pub unconfirmed: usize,
    pub users: usize,
    pub client_id: Uuid,
}

enum EngineCommand<D: SyncDoc> {
    Edit {
        steps: Vec<D::Step>,
        reply: oneshot::Sender<Result<Version, EditError>>,
    },
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot<D>>,
    },
    Restart,
    Shutdown,
}

/// Cloneable handle to a running engine.
pub struct EngineHandle<D: SyncDoc> {
    commands: mpsc::Sender<EngineCommand<D>>,
}

impl<D: SyncDoc> Clone for EngineHandle<D> {
    fn clone(&self) -> Self {
        EngineHandle {
            commands: self.commands.clone(),
        }
    }
}

impl<D: SyncDoc> EngineHandle<D> {
    /// Apply steps to the local doc and queue them for the manager. Returns
    /// the synced base version the steps were applied on top of.
    pub async fn edit(&self, steps: Vec<D::Step>) -> Result<Version, EditError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(EngineCommand::Edit { steps, reply })
            .await
            .map_err(|_| EditError::EngineGone)?;
        answer.await.map_err(|_| EditError::EngineGone)?
    }

    pub async fn snapshot(&self) -> Option<EngineSnapshot<D>> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(EngineCommand::Snapshot { reply })
            .await
            .ok()?;
        answer.await.ok()
    }

    /// Drop the current sync anchor and reload from the manager. Surviving
    /// local edits are replayed on the fresh document.
    pub async fn restart(&self) -> bool {
        self.commands.send(EngineCommand::Restart).await.is_ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown).await;
    }
}

struct LocalStep<D: SyncDoc> {
    step: D::Step,
    /// Inverse against the doc this step was applied to, kept current across
    /// rebases so unwinding is always possible.
    inverted: D::Step,
}

struct EditState<D: SyncDoc> {
    doc: D,
    version: Version,
    unconfirmed: Vec<LocalStep<D>>,
}

enum Flow {
    Continue,
    Stop,
}

enum AfterCommand {
    Continue,
    Redispatch,
    Shutdown,
}

pub struct SyncEngine<D: SyncDoc> {
    comm: Arc<ClientCommunication<D>>,
    config: EngineConfig,
    client_id: Uuid,
    user_id: Uuid,
    commands: mpsc::Receiver<EngineCommand<D>>,
    notices: mpsc::Receiver<Version>,
    events: mpsc::Sender<EngineEvent>,
    phase: Phase,
    state: Option<EditState<D>>,
    manager_id: Uuid,
    users: usize,
    backoff: Duration,
    /// Leading unconfirmed entries covered by a push whose outcome is not
    /// settled: still on the wire, or timed out and possibly committed
    /// anyway. They must stay one entry per pushed step — never compacted
    /// with later edits — until an acknowledgement or a non-empty pull
    /// reveals what the manager committed.
    pushed: usize,
}

impl<D: SyncDoc> SyncEngine<D> {
    pub fn new(
        comm: ClientCommunication<D>,
        notices: mpsc::Receiver<Version>,
        user_id: Uuid,
        config: EngineConfig,
    ) -> (Self, EngineHandle<D>, mpsc::Receiver<EngineEvent>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let engine = SyncEngine {
            comm: Arc::new(comm),
            config,
            client_id: Uuid::new_v4(),
            user_id,
            commands: command_rx,
            notices,
            events: event_tx,
            phase: Phase::Start,
            state: None,
            manager_id: Uuid::nil(),
            users: 0,
            backoff: Duration::ZERO,
            pushed: 0,
        };
        let handle = EngineHandle {
            commands: command_tx,
        };
        (engine, handle, event_rx)
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// Drive the engine until shutdown. Meant to be spawned:
    /// `tokio::spawn(engine.run())`.
    pub async fn run(mut self) {
        log::info!(
            "sync engine for '{}' starting as client {}",
            self.comm.doc_name(),
            self.client_id
        );
        loop {
            let flow = match self.phase {
                Phase::Start => self.run_start().await,
                Phase::Poll => self.run_poll().await,
                Phase::Send => self.run_send().await,
                Phase::Recover => self.run_recover().await,
                Phase::Detached | Phase::Halted => self.run_idle().await,
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }
        log::info!("sync engine for '{}' stopped", self.comm.doc_name());
    }

    async fn run_start(&mut self) -> Flow {
        let comm = Arc::clone(&self.comm);
        let user_id = self.user_id;
        let load = async move { comm.get_document(user_id).await };
        tokio::pin!(load);
        loop {
            tokio::select! {
                loaded = &mut load => {
                    return match loaded {
                        Ok(loaded) => {
                            let version = loaded.version;
                            self.install(loaded);
                            self.emit(EngineEvent::Loaded { version }).await;
                            if let Some(size) = self.over_ceiling() {
                                self.detach(size).await;
                            } else {
                                self.resume_sync();
                            }
                            Flow::Continue
                        }
                        Err(e) => {
                            log::error!("initial load of '{}' failed: {e}", self.comm.doc_name());
                            self.emit(EngineEvent::StartFailed {
                                reason: e.to_string(),
                            })
                            .await;
                            self.park_until_restart().await
                        }
                    };
                }
                command = self.commands.recv() => {
                    match self.handle_command(command, false).await {
                        AfterCommand::Shutdown => return Flow::Stop,
                        AfterCommand::Redispatch => return Flow::Continue,
                        AfterCommand::Continue => {}
                    }
                }
                Some(_) = self.notices.recv() => {}
            }
        }
    }

    /// Failed starts do not retry on their own; the engine sits here until
    /// an explicit restart (or shutdown). Edits still apply locally and are
    /// carried into the next load.
    async fn park_until_restart(&mut self) -> Flow {
        loop {
            match self.commands.recv().await {
                None | Some(EngineCommand::Shutdown) => return Flow::Stop,
                Some(EngineCommand::Restart) => {
                    self.restart_sync("restart requested").await;
                    return Flow::Continue;
                }
                Some(EngineCommand::Snapshot { reply }) => {
                    let _ = reply.send(self.snapshot());
                }
                Some(EngineCommand::Edit { steps, reply }) => {
                    let _ = reply.send(self.apply_local(steps));
                }
            }
        }
    }

    async fn run_poll(&mut self) -> Flow {
        let Some(version) = self.state.as_ref().map(|s| s.version) else {
            self.begin_restart();
            return Flow::Continue;
        };
        let comm = Arc::clone(&self.comm);
        let user_id = self.user_id;
        let manager_id = self.manager_id;
        let pull = async move { comm.pull_events(version, user_id, manager_id).await };
        tokio::pin!(pull);
        loop {
            tokio::select! {
                pulled = &mut pull => return self.on_pulled(pulled).await,
                command = self.commands.recv() => {
                    // A local edit cancels the in-flight pull and switches to
                    // sending; the dropped request's reply subscription goes
                    // with it.
                    match self.handle_command(command, true).await {
                        AfterCommand::Shutdown => return Flow::Stop,
                        AfterCommand::Redispatch => return Flow::Continue,
                        AfterCommand::Continue => {}
                    }
                }
                Some(_) = self.notices.recv() => {}
            }
        }
    }

    async fn on_pulled(&mut self, pulled: Result<DocEvents<D>, CommError>) -> Flow {
        match pulled {
            Ok(events) => {
                self.backoff = Duration::ZERO;
                self.users = events.users;
                if events.steps.is_empty() {
                    // Edits queued while the pull was out take precedence
                    // over waiting for more remote steps.
                    if self.has_sendable() {
                        self.set_phase(Phase::Send);
                        return Flow::Continue;
                    }
                    return self.pause_between_polls().await;
                }
                match self.integrate_remote(events.steps).await {
                    Ok(()) => {
                        if let Some(size) = self.over_ceiling() {
                            self.detach(size).await;
                        } else {
                            self.resume_sync();
                        }
                        Flow::Continue
                    }
                    Err(reason) => {
                        self.halt(reason).await;
                        Flow::Continue
                    }
                }
            }
            Err(CommError::Rejected(FailureKind::InvalidVersion))
            | Err(CommError::Rejected(FailureKind::HistoryNotAvailable)) => {
                self.restart_sync("document history moved beyond our version")
                    .await;
                Flow::Continue
            }
            Err(CommError::Unresponsive) => {
                self.set_phase(Phase::Recover);
                Flow::Continue
            }
            Err(e) => {
                self.halt(format!("pull failed: {e}")).await;
                Flow::Continue
            }
        }
    }

    /// Quiet document: wait a beat before polling again, unless a new
    /// version is announced or a local edit needs sending.
    async fn pause_between_polls(&mut self) -> Flow {
        let sleep = tokio::time::sleep(self.config.poll_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Flow::Continue,
                Some(version) = self.notices.recv() => {
                    log::trace!(
                        "'{}' announced at version {version}; polling early",
                        self.comm.doc_name()
                    );
                    return Flow::Continue;
                }
                command = self.commands.recv() => {
                    match self.handle_command(command, true).await {
                        AfterCommand::Shutdown => return Flow::Stop,
                        AfterCommand::Redispatch => return Flow::Continue,
                        AfterCommand::Continue => {}
                    }
                }
            }
        }
    }

    async fn run_send(&mut self) -> Flow {
        let Some((version, batch)) = self.state.as_ref().map(|s| {
            let batch: Vec<D::Step> = s.unconfirmed.iter().map(|l| l.step.clone()).collect();
            (s.version, batch)
        }) else {
            self.begin_restart();
            return Flow::Continue;
        };
        if batch.is_empty() {
            self.set_phase(Phase::Poll);
            return Flow::Continue;
        }
        let sent = batch.len();
        self.pushed = sent;
        let comm = Arc::clone(&self.comm);
        let client_id = self.client_id;
        let user_id = self.user_id;
        let manager_id = self.manager_id;
        let push =
            async move { comm.push_events(version, batch, client_id, user_id, manager_id).await };
        tokio::pin!(push);
        loop {
            tokio::select! {
                pushed = &mut push => return self.on_pushed(pushed, sent).await,
                command = self.commands.recv() => {
                    // Edits made while the push is on the wire queue behind
                    // it; the push itself is never canceled.
                    match self.handle_command(command, false).await {
                        AfterCommand::Shutdown => return Flow::Stop,
                        AfterCommand::Redispatch => return Flow::Continue,
                        AfterCommand::Continue => {}
                    }
                }
                Some(_) = self.notices.recv() => {}
            }
        }
    }

    async fn on_pushed(&mut self, pushed: Result<(), CommError>, sent: usize) -> Flow {
        match pushed {
            Ok(()) => {
                self.backoff = Duration::ZERO;
                self.pushed = 0;
                let version = {
                    let Some(state) = self.state.as_mut() else {
                        return Flow::Continue;
                    };
                    let confirmed = sent.min(state.unconfirmed.len());
                    state.unconfirmed.drain(..confirmed);
                    state.version += sent as u64;
                    state.version
                };
                self.emit(EngineEvent::Confirmed {
                    count: sent,
                    version,
                })
                .await;
                self.resume_sync();
                Flow::Continue
            }
            Err(CommError::Rejected(FailureKind::OutdatedVersion)) => {
                // Someone else got there first — or an earlier timed-out push
                // of ours did. The pull tells those apart, so the watermark
                // stays up until it settles the queue head. Not a fault, so
                // no backoff.
                log::debug!(
                    "push for '{}' raced a concurrent writer; catching up",
                    self.comm.doc_name()
                );
                self.backoff = Duration::ZERO;
                self.set_phase(Phase::Poll);
                Flow::Continue
            }
            Err(CommError::Rejected(FailureKind::InvalidVersion)) => {
                self.restart_sync("push rejected as invalid for this instance")
                    .await;
                Flow::Continue
            }
            Err(CommError::Unresponsive) => {
                // The manager may have committed the batch and lost only the
                // reply. Its steps stay pinned until a response or a pull
                // reveals their fate.
                self.set_phase(Phase::Recover);
                Flow::Continue
            }
            Err(e) => {
                self.halt(format!("push failed: {e}")).await;
                Flow::Continue
            }
        }
    }

    async fn run_recover(&mut self) -> Flow {
        self.backoff = next_backoff(self.backoff, self.config.backoff_base, self.config.backoff_cap);
        log::warn!(
            "manager unreachable for '{}'; retrying in {:?}",
            self.comm.doc_name(),
            self.backoff
        );
        self.emit(EngineEvent::Recovering {
            retry_in: self.backoff,
        })
        .await;
        let sleep = tokio::time::sleep(self.backoff);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => {
                    // Anything queued during the outage goes out first.
                    self.resume_sync();
                    return Flow::Continue;
                }
                command = self.commands.recv() => {
                    match self.handle_command(command, false).await {
                        AfterCommand::Shutdown => return Flow::Stop,
                        AfterCommand::Redispatch => return Flow::Continue,
                        AfterCommand::Continue => {}
                    }
                }
                Some(_) = self.notices.recv() => {}
            }
        }
    }

    /// Detached and halted engines keep serving local edits and snapshots;
    /// only an explicit restart re-enters the sync loop.
    async fn run_idle(&mut self) -> Flow {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match self.handle_command(command, false).await {
                        AfterCommand::Shutdown => return Flow::Stop,
                        AfterCommand::Redispatch => return Flow::Continue,
                        AfterCommand::Continue => {}
                    }
                }
                Some(_) = self.notices.recv() => {}
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: Option<EngineCommand<D>>,
        cancelable_poll: bool,
    ) -> AfterCommand {
        let Some(command) = command else {
            return AfterCommand::Shutdown;
        };
        match command {
            EngineCommand::Shutdown => AfterCommand::Shutdown,
            EngineCommand::Restart => {
                self.restart_sync("restart requested").await;
                AfterCommand::Redispatch
            }
            EngineCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                AfterCommand::Continue
            }
            EngineCommand::Edit { steps, reply } => {
                let outcome = self.apply_local(steps);
                let accepted = outcome.is_ok();
                let _ = reply.send(outcome);
                if !accepted {
                    return AfterCommand::Continue;
                }
                if matches!(self.phase, Phase::Start | Phase::Poll | Phase::Send | Phase::Recover) {
                    if let Some(size) = self.over_ceiling() {
                        self.detach(size).await;
                        return AfterCommand::Redispatch;
                    }
                }
                if cancelable_poll && self.has_sendable() {
                    self.set_phase(Phase::Send);
                    return AfterCommand::Redispatch;
                }
                AfterCommand::Continue
            }
        }
    }

    /// Apply steps to the local doc and queue them as unconfirmed,
    /// compacting into the queue tail when the tail is past the push
    /// watermark.
    fn apply_local(&mut self, steps: Vec<D::Step>) -> Result<Version, EditError> {
        let pushed = self.pushed;
        let Some(state) = self.state.as_mut() else {
            return Err(EditError::NotReady);
        };

        let mut doc = state.doc.clone();
        let mut added: Vec<LocalStep<D>> = Vec::with_capacity(steps.len());
        for step in steps {
            let inverted = step.invert(&doc);
            doc = doc.apply(&step).map_err(EditError::Rejected)?;
            added.push(LocalStep { step, inverted });
        }

        state.doc = doc;
        for local in added {
            let merged = if state.unconfirmed.len() > pushed {
                state.unconfirmed.last().and_then(|tail| {
                    match (tail.step.merge(&local.step), local.inverted.merge(&tail.inverted)) {
                        (Some(step), Some(inverted)) => Some(LocalStep { step, inverted }),
                        _ => None,
                    }
                })
            } else {
                None
            };
            match merged {
                Some(merged) => {
                    if let Some(tail) = state.unconfirmed.last_mut() {
                        *tail = merged;
                    }
                }
                None => state.unconfirmed.push(local),
            }
        }
        Ok(state.version)
    }

    async fn integrate_remote(&mut self, steps: Vec<CommittedStep<D>>) -> Result<(), String> {
        let client_id = self.client_id;
        let Some(state) = self.state.as_mut() else {
            return Err("pull delivered steps before any document was loaded".to_string());
        };
        let outcome = integrate_remote_steps(state, steps, client_id)?;
        // A non-empty pull settles any unsettled push: our steps at its head
        // mean the push committed (the fold confirms them in place), a
        // foreign head means the push's base version is stale forever.
        self.pushed = 0;
        if outcome.confirmed > 0 {
            self.emit(EngineEvent::Confirmed {
                count: outcome.confirmed,
                version: outcome.version,
            })
            .await;
        }
        if outcome.foreign > 0 {
            self.emit(EngineEvent::RemoteSteps {
                count: outcome.foreign,
                version: outcome.version,
            })
            .await;
        }
        Ok(())
    }

    fn install(&mut self, loaded: LoadedDoc<D>) {
        // Edits made before or during the (re)load replay onto the fresh doc.
        let carried = self
            .state
            .take()
            .map(|s| s.unconfirmed)
            .unwrap_or_default();
        let mut doc = loaded.doc;
        let mut unconfirmed = Vec::with_capacity(carried.len());
        for local in carried {
            let inverted = local.step.invert(&doc);
            match doc.apply(&local.step) {
                Ok(next) => {
                    doc = next;
                    unconfirmed.push(LocalStep {
                        step: local.step,
                        inverted,
                    });
                }
                Err(e) => {
                    log::warn!("dropping local step that no longer applies after reload: {e}")
                }
            }
        }
        log::debug!(
            "'{}' loaded at version {} with {} carried local steps",
            self.comm.doc_name(),
            loaded.version,
            unconfirmed.len()
        );
        self.manager_id = loaded.manager_id;
        self.users = loaded.users;
        self.backoff = Duration::ZERO;
        self.state = Some(EditState {
            doc,
            version: loaded.version,
            unconfirmed,
        });
    }

    async fn restart_sync(&mut self, why: &str) {
        log::warn!("restarting sync for '{}': {why}", self.comm.doc_name());
        self.begin_restart();
        self.emit(EngineEvent::Restarted).await;
    }

    fn begin_restart(&mut self) {
        self.pushed = 0;
        self.backoff = Duration::ZERO;
        self.manager_id = Uuid::nil();
        self.set_phase(Phase::Start);
    }

    fn resume_sync(&mut self) {
        if self.has_sendable() {
            self.set_phase(Phase::Send);
        } else {
            self.set_phase(Phase::Poll);
        }
    }

    fn has_sendable(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| !s.unconfirmed.is_empty())
    }

    fn over_ceiling(&self) -> Option<usize> {
        let state = self.state.as_ref()?;
        let size = state.doc.size();
        (size > self.config.max_doc_size).then_some(size)
    }

    async fn detach(&mut self, size: usize) {
        log::warn!(
            "'{}' grew past the sync ceiling ({size} > {}); edits stay local now",
            self.comm.doc_name(),
            self.config.max_doc_size
        );
        self.pushed = 0;
        self.set_phase(Phase::Detached);
        self.emit(EngineEvent::Detached { size }).await;
    }

    async fn halt(&mut self, reason: String) {
        log::error!("sync for '{}' halted: {reason}", self.comm.doc_name());
        self.pushed = 0;
        self.set_phase(Phase::Halted);
        self.emit(EngineEvent::Halted { reason }).await;
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            log::debug!(
                "'{}' sync phase {} -> {}",
                self.comm.doc_name(),
                self.phase,
                phase
            );
            self.phase = phase;
        }
    }

    fn snapshot(&self) -> EngineSnapshot<D> {
        EngineSnapshot {
            phase: self.phase,
            doc: self.state.as_ref().map(|s| s.doc.clone()),
            version: self.state.as_ref().map_or(0, |s| s.version),
            unconfirmed: self.state.as_ref().map_or(0, |s| s.unconfirmed.len()),
            users: self.users,
            client_id: self.client_id,
        }
    }

    async fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event).await;
    }
}

struct Integration {
    confirmed: usize,
    foreign: usize,
    version: Version,
}

/// Fold a pulled batch into local state. Steps at the head that carry our
/// own client id confirm queued local steps in place; the rest rebases the
/// remaining queue. Errors mean local and remote state have diverged in a
/// way we cannot repair.
fn integrate_remote_steps<D: SyncDoc>(
    state: &mut EditState<D>,
    steps: Vec<CommittedStep<D>>,
    client_id: Uuid,
) -> Result<Integration, String> {
    let mut confirmed = 0;
    while confirmed < steps.len()
        && confirmed < state.unconfirmed.len()
        && steps[confirmed].client_id == client_id
    {
        confirmed += 1;
    }
    let total = steps.len() as u64;
    let foreign = &steps[confirmed..];
    state.unconfirmed.drain(..confirmed);

    if foreign.is_empty() {
        state.version += total;
        return Ok(Integration {
            confirmed,
            foreign: 0,
            version: state.version,
        });
    }

    let pending = std::mem::take(&mut state.unconfirmed);
    let mut doc = state.doc.clone();
    for local in pending.iter().rev() {
        doc = doc
            .apply(&local.inverted)
            .map_err(|e| format!("failed to unwind a local step: {e}"))?;
    }
    for committed in foreign {
        doc = doc
            .apply(&committed.step)
            .map_err(|e| format!("a committed remote step does not apply: {e}"))?;
    }
    let mut kept = Vec::with_capacity(pending.len());
    for local in pending {
        let inverted = local.step.invert(&doc);
        match doc.apply(&local.step) {
            Ok(next) => {
                doc = next;
                kept.push(LocalStep {
                    step: local.step,
                    inverted,
                });
            }
            Err(e) => log::warn!("dropping local step displaced by a remote edit: {e}"),
        }
    }

    state.doc = doc;
    state.version += total;
    state.unconfirmed = kept;
    Ok(Integration {
        confirmed,
        foreign: foreign.len(),
        version: state.version,
    })
}

fn next_backoff(current: Duration, base: Duration, cap: Duration) -> Duration {
    if current.is_zero() {
        base.min(cap)
    } else {
        (current * 2).min(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::MANAGER_ADDRESS;
    use crate::config::CommTimeouts;
    use crate::protocol::CollabPayload;
    use crate::text::{TextDoc, TextStep};
    use vellum_comms::MessageBus;

    fn engine() -> SyncEngine<TextDoc> {
        let bus: MessageBus<CollabPayload<TextDoc>> = MessageBus::new();
        let (comm, notices) =
            ClientCommunication::connect(bus, MANAGER_ADDRESS, "doc", CommTimeouts::for_testing());
        let (engine, _handle, _events) =
            SyncEngine::new(comm, notices, Uuid::new_v4(), EngineConfig::for_testing());
        engine
    }

    fn local(doc: &TextDoc, step: TextStep) -> (TextDoc, LocalStep<TextDoc>) {
        let inverted = step.invert(doc);
        let next = doc.apply(&step).unwrap();
        (next, LocalStep { step, inverted })
    }

    fn committed(step: TextStep, client_id: Uuid) -> CommittedStep<TextDoc> {
        CommittedStep { step, client_id }
    }

    #[test]
    fn test_next_backoff_doubles_to_cap() {
        let base = Duration::from_millis(200);
        let cap = Duration::from_secs(60);
        let mut delay = Duration::ZERO;
        let mut seen = Vec::new();
        for _ in 0..12 {
            delay = next_backoff(delay, base, cap);
            seen.push(delay.as_millis());
        }
        assert_eq!(seen[0], 200);
        assert_eq!(seen[1], 400);
        assert_eq!(seen[7], 25_600);
        assert_eq!(*seen.last().unwrap(), 60_000);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_own_steps_at_head_confirm_without_reapplying() {
        let mine = Uuid::new_v4();
        let base = TextDoc::new("");
        let (doc, first) = local(&base, TextStep::insert(0, "a"));
        let (doc, second) = local(&doc, TextStep::insert(1, "b"));
        let mut state = EditState {
            doc,
            version: 4,
            unconfirmed: vec![first, second],
        };

        let outcome = integrate_remote_steps(
            &mut state,
            vec![
                committed(TextStep::insert(0, "a"), mine),
                committed(TextStep::insert(1, "b"), mine),
            ],
            mine,
        )
        .unwrap();

        assert_eq!(outcome.confirmed, 2);
        assert_eq!(outcome.foreign, 0);
        assert_eq!(state.version, 6);
        assert_eq!(state.doc.text(), "ab");
        assert!(state.unconfirmed.is_empty());
    }

    #[test]
    fn test_foreign_steps_rebase_local_queue() {
        let mine = Uuid::new_v4();
        let other = Uuid::new_v4();
        let base = TextDoc::new("ab");
        let (doc, pending) = local(&base, TextStep::insert(2, "X"));
        let mut state = EditState {
            doc,
            version: 2,
            unconfirmed: vec![pending],
        };

        let outcome = integrate_remote_steps(
            &mut state,
            vec![committed(TextStep::insert(2, "Y"), other)],
            mine,
        )
        .unwrap();

        assert_eq!(outcome.confirmed, 0);
        assert_eq!(outcome.foreign, 1);
        assert_eq!(state.version, 3);
        assert_eq!(state.doc.text(), "abXY");
        assert_eq!(state.unconfirmed.len(), 1);
    }

    #[test]
    fn test_displaced_local_step_is_dropped() {
        let mine = Uuid::new_v4();
        let other = Uuid::new_v4();
        let base = TextDoc::new("abc");
        let delete = TextStep::delete(&base, 1, 2).unwrap();
        let (doc, pending) = local(&base, delete.clone());
        let mut state = EditState {
            doc,
            version: 1,
            unconfirmed: vec![pending],
        };

        // The same range was deleted remotely; the replay cannot fit.
        let outcome =
            integrate_remote_steps(&mut state, vec![committed(delete, other)], mine).unwrap();

        assert_eq!(outcome.foreign, 1);
        assert_eq!(state.doc.text(), "ac");
        assert!(state.unconfirmed.is_empty());
    }

    #[test]
    fn test_own_head_then_foreign_tail() {
        let mine = Uuid::new_v4();
        let other = Uuid::new_v4();
        let base = TextDoc::new("");
        let (doc, first) = local(&base, TextStep::insert(0, "a"));
        let mut state = EditState {
            doc,
            version: 0,
            unconfirmed: vec![first],
        };

        let outcome = integrate_remote_steps(
            &mut state,
            vec![
                committed(TextStep::insert(0, "a"), mine),
                committed(TextStep::insert(1, "z"), other),
            ],
            mine,
        )
        .unwrap();

        assert_eq!(outcome.confirmed, 1);
        assert_eq!(outcome.foreign, 1);
        assert_eq!(state.version, 2);
        assert_eq!(state.doc.text(), "az");
        assert!(state.unconfirmed.is_empty());
    }

    #[test]
    fn test_local_edits_compact_into_tail() {
        let mut engine = engine();
        engine.state = Some(EditState {
            doc: TextDoc::initial(),
            version: 0,
            unconfirmed: Vec::new(),
        });

        engine.apply_local(vec![TextStep::insert(0, "a")]).unwrap();
        engine.apply_local(vec![TextStep::insert(1, "b")]).unwrap();

        let state = engine.state.as_ref().unwrap();
        assert_eq!(state.doc.text(), "ab");
        assert_eq!(state.unconfirmed.len(), 1);
        assert_eq!(state.unconfirmed[0].step, TextStep::insert(0, "ab"));
        // The stored inverse must undo the merged step in one go.
        let undone = state.doc.apply(&state.unconfirmed[0].inverted).unwrap();
        assert_eq!(undone.text(), "");
    }

    #[test]
    fn test_steps_on_the_wire_are_not_compacted() {
        let mut engine = engine();
        engine.state = Some(EditState {
            doc: TextDoc::initial(),
            version: 0,
            unconfirmed: Vec::new(),
        });

        engine.apply_local(vec![TextStep::insert(0, "a")]).unwrap();
        engine.pushed = 1;
        engine.apply_local(vec![TextStep::insert(1, "b")]).unwrap();

        assert_eq!(engine.state.as_ref().unwrap().unconfirmed.len(), 2);
    }

    #[tokio::test]
    async fn test_timed_out_push_settles_without_losing_later_edits() {
        let bus: MessageBus<CollabPayload<TextDoc>> = MessageBus::new();
        let (comm, notices) =
            ClientCommunication::connect(bus, MANAGER_ADDRESS, "doc", CommTimeouts::for_testing());
        let (mut engine, _handle, _events) =
            SyncEngine::new(comm, notices, Uuid::new_v4(), EngineConfig::for_testing());
        engine.state = Some(EditState {
            doc: TextDoc::initial(),
            version: 0,
            unconfirmed: Vec::new(),
        });

        // A one-step push goes out against a silent manager and times out,
        // though the manager may have committed it before losing the reply.
        engine.apply_local(vec![TextStep::insert(0, "a")]).unwrap();
        engine.set_phase(Phase::Send);
        assert!(matches!(engine.run_send().await, Flow::Continue));
        assert_eq!(engine.phase, Phase::Recover);
        assert_eq!(engine.pushed, 1);

        // An edit during the backoff must queue behind the unsettled step,
        // not merge into it.
        engine.apply_local(vec![TextStep::insert(1, "b")]).unwrap();
        assert_eq!(engine.state.as_ref().unwrap().unconfirmed.len(), 2);

        // The retry carries both steps and is rejected as outdated, because
        // the first push did land. That alone settles nothing.
        engine.pushed = 2;
        engine
            .on_pushed(Err(CommError::Rejected(FailureKind::OutdatedVersion)), 2)
            .await;
        assert_eq!(engine.phase, Phase::Poll);
        assert_eq!(engine.pushed, 2);

        // The pull finds the committed step under our own id: confirm
        // exactly that step and keep the later edit queued for sending.
        let client_id = engine.client_id;
        engine
            .integrate_remote(vec![committed(TextStep::insert(0, "a"), client_id)])
            .await
            .unwrap();
        assert_eq!(engine.pushed, 0);

        let state = engine.state.as_ref().unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.doc.text(), "ab");
        assert_eq!(state.unconfirmed.len(), 1);
        assert_eq!(state.unconfirmed[0].step, TextStep::insert(1, "b"));
        assert!(engine.has_sendable());
    }

    #[test]
    fn test_edit_before_load_is_rejected() {
        let mut engine = engine();
        let err = engine
            .apply_local(vec![TextStep::insert(0, "a")])
            .unwrap_err();
        assert_eq!(err, EditError::NotReady);
    }

    #[test]
    fn test_rejected_edit_leaves_state_untouched() {
        let mut engine = engine();
        engine.state = Some(EditState {
            doc: TextDoc::new("ab"),
            version: 5,
            unconfirmed: Vec::new(),
        });

        let err = engine
            .apply_local(vec![TextStep::insert(0, "x"), TextStep::insert(99, "y")])
            .unwrap_err();
        assert!(matches!(err, EditError::Rejected(_)));

        let state = engine.state.as_ref().unwrap();
        assert_eq!(state.doc.text(), "ab");
        assert!(state.unconfirmed.is_empty());
        assert_eq!(state.version, 5);
    }

    #[test]
    fn test_snapshot_before_load() {
        let engine = engine();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.phase, Phase::Start);
        assert!(snapshot.doc.is_none());
        assert_eq!(snapshot.version, 0);
    }
}
