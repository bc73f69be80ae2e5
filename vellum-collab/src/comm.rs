//! Typed bus endpoints for the collab protocol.
//!
//! [`ManagerCommunication`] parks a [`CollabManager`] behind a bus address:
//! every ping carrying a request is dispatched on its own task (a parked
//! long poll must not block the next request) and answered with a correlated
//! pong, and the manager's `NewVersion` announcements are pumped out as bus
//! broadcasts.
//!
//! [`ClientCommunication`] is the other end: typed `async` wrappers around
//! the request/response cycle, plus a channel of `NewVersion` versions for
//! this endpoint's document so a sleeping poller can wake early.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use vellum_comms::{request, respond, Envelope, Handler, MessageBus, RequestError, Subscription};

use crate::config::CommTimeouts;
use crate::doc::{SyncDoc, Version};
use crate::protocol::{
    CollabNotice, CollabPayload, CollabRequest, CollabResponse, DocName, FailureKind,
};
use crate::server::instance::DocEvents;
use crate::server::manager::CollabManager;

/// Address managers conventionally listen on.
pub const MANAGER_ADDRESS: &str = "collab/manager";

/// What went wrong talking to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommError {
    /// No reply within the deadline.
    Unresponsive,
    /// The manager answered, and the answer was no.
    Rejected(FailureKind),
    /// The bus was destroyed.
    Closed,
    /// The reply had a shape this request cannot have produced.
    Protocol(&'static str),
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommError::Unresponsive => write!(f, "manager did not respond in time"),
            CommError::Rejected(kind) => write!(f, "manager refused: {kind}"),
            CommError::Closed => write!(f, "message bus closed"),
            CommError::Protocol(what) => write!(f, "protocol violation: {what}"),
        }
    }
}

impl std::error::Error for CommError {}

/// Result of a successful document load.
#[derive(Debug, Clone)]
pub struct LoadedDoc<D: SyncDoc> {
    pub doc: D,
    pub version: Version,
    pub users: usize,
    pub manager_id: Uuid,
}

/// Client-side endpoint bound to one document.
pub struct ClientCommunication<D: SyncDoc> {
    bus: MessageBus<CollabPayload<D>>,
    address: String,
    manager_address: String,
    doc_name: DocName,
    timeouts: CommTimeouts,
    _notices: Subscription<CollabPayload<D>>,
}

impl<D: SyncDoc> ClientCommunication<D> {
    /// Attach to the bus under a fresh client address. The returned channel
    /// yields the version from each `NewVersion` announcement for
    /// `doc_name`; if the consumer falls behind, announcements are dropped
    /// (they are wake hints, not data).
    pub fn connect(
        bus: MessageBus<CollabPayload<D>>,
        manager_address: impl Into<String>,
        doc_name: impl Into<DocName>,
        timeouts: CommTimeouts,
    ) -> (Self, mpsc::Receiver<Version>) {
        let address = format!("client/{}", Uuid::new_v4());
        let manager_address = manager_address.into();
        let doc_name: DocName = doc_name.into();
        let (notice_tx, notice_rx) = mpsc::channel(64);

        let handler: Handler<CollabPayload<D>> = Arc::new({
            let manager_address = manager_address.clone();
            let doc_name = doc_name.clone();
            move |envelope| {
                let Envelope::Broadcast { from, body, .. } = &**envelope else {
                    return;
                };
                if *from != manager_address {
                    return;
                }
                if let CollabPayload::Notice(CollabNotice::NewVersion { doc_name: name, version }) =
                    body
                {
                    if *name == doc_name {
                        let _ = notice_tx.try_send(*version);
                    }
                }
            }
        });
        let notices = bus.subscribe(address.clone(), handler);

        let comm = ClientCommunication {
            bus,
            address,
            manager_address,
            doc_name,
            timeouts,
            _notices: notices,
        };
        (comm, notice_rx)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    pub async fn get_document(&self, user_id: Uuid) -> Result<LoadedDoc<D>, CommError> {
        let payload = CollabPayload::Request(CollabRequest::GetDocument {
            doc_name: self.doc_name.clone(),
            user_id,
        });
        match self.ask(payload, self.timeouts.request).await? {
            CollabResponse::Document {
                doc,
                version,
                users,
                manager_id,
            } => Ok(LoadedDoc {
                doc,
                version,
                users,
                manager_id,
            }),
            _ => Err(CommError::Protocol("load answered with an unexpected body")),
        }
    }

    /// Pull steps after `version`. Uses the long deadline since the manager
    /// may hold the request open.
    pub async fn pull_events(
        &self,
        version: Version,
        user_id: Uuid,
        manager_id: Uuid,
    ) -> Result<DocEvents<D>, CommError> {
        let payload = CollabPayload::Request(CollabRequest::PullEvents {
            doc_name: self.doc_name.clone(),
            version,
            user_id,
            manager_id,
        });
        match self.ask(payload, self.timeouts.pull).await? {
            CollabResponse::Events { steps, users } => Ok(DocEvents { steps, users }),
            _ => Err(CommError::Protocol("pull answered with an unexpected body")),
        }
    }

    pub async fn push_events(
        &self,
        version: Version,
        steps: Vec<D::Step>,
        client_id: Uuid,
        user_id: Uuid,
        manager_id: Uuid,
    ) -> Result<(), CommError> {
        let payload = CollabPayload::Request(CollabRequest::PushEvents {
            doc_name: self.doc_name.clone(),
            version,
            steps,
            client_id,
            user_id,
            manager_id,
        });
        match self.ask(payload, self.timeouts.request).await? {
            CollabResponse::Pushed => Ok(()),
            _ => Err(CommError::Protocol("push answered with an unexpected body")),
        }
    }

    async fn ask(
        &self,
        payload: CollabPayload<D>,
        deadline: Duration,
    ) -> Result<CollabResponse<D>, CommError> {
        let reply = request(
            &self.bus,
            &self.manager_address,
            &self.address,
            payload,
            deadline,
        )
        .await;
        match reply {
            Ok(CollabPayload::Response(CollabResponse::Failure(kind))) => {
                Err(CommError::Rejected(kind))
            }
            Ok(CollabPayload::Response(response)) => Ok(response),
            Ok(_) => Err(CommError::Protocol("reply was not a response payload")),
            Err(RequestError::Timeout) => Err(CommError::Unresponsive),
            Err(RequestError::BusDestroyed) => Err(CommError::Closed),
        }
    }
}

/// Serves a manager at a bus address until dropped.
pub struct ManagerCommunication<D: SyncDoc> {
    address: String,
    _requests: Subscription<CollabPayload<D>>,
    pump: JoinHandle<()>,
}

impl<D: SyncDoc> ManagerCommunication<D> {
    pub fn start(
        bus: MessageBus<CollabPayload<D>>,
        address: impl Into<String>,
        manager: Arc<CollabManager<D>>,
    ) -> Self {
        let address = address.into();
        let updates = manager.subscribe_updates();

        let requests = bus.subscribe(address.clone(), Arc::new({
            let bus = bus.clone();
            let manager = Arc::clone(&manager);
            let own = address.clone();
            move |envelope: &Arc<Envelope<CollabPayload<D>>>| {
                let Envelope::Ping { from, id, body, .. } = &**envelope else {
                    return;
                };
                let CollabPayload::Request(request) = body else {
                    log::error!("manager address pinged with a non-request payload");
                    return;
                };
                // Each request runs on its own task: a parked long poll must
                // not hold up the requests behind it.
                let bus = bus.clone();
                let manager = Arc::clone(&manager);
                let own = own.clone();
                let reply_to = from.clone();
                let id = *id;
                let request = request.clone();
                tokio::spawn(async move {
                    let response = dispatch(&manager, request).await;
                    respond(&bus, reply_to, own, id, CollabPayload::Response(response));
                });
            }
        }));

        let pump = tokio::spawn(Self::pump_updates(bus, address.clone(), updates));
        log::info!("manager serving at '{address}'");
        ManagerCommunication {
            address,
            _requests: requests,
            pump,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn pump_updates(
        bus: MessageBus<CollabPayload<D>>,
        address: String,
        mut updates: broadcast::Receiver<CollabNotice>,
    ) {
        loop {
            match updates.recv().await {
                Ok(notice) => {
                    bus.publish(Envelope::broadcast(
                        address.clone(),
                        CollabPayload::Notice(notice),
                    ));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("update pump lagged by {missed} announcements");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl<D: SyncDoc> Drop for ManagerCommunication<D> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn dispatch<D: SyncDoc>(
    manager: &Arc<CollabManager<D>>,
    request: CollabRequest<D>,
) -> CollabResponse<D> {
    match request {
        CollabRequest::GetDocument { doc_name, user_id } => {
            match manager.get_document(&doc_name, user_id).await {
                Ok((doc, version, users)) => CollabResponse::Document {
                    doc,
                    version,
                    users,
                    manager_id: manager.id(),
                },
                Err(kind) => CollabResponse::Failure(kind),
            }
        }
        CollabRequest::PullEvents {
            doc_name,
            version,
            user_id,
            manager_id,
        } => match manager.get_events(&doc_name, version, user_id, manager_id).await {
            Ok(events) => CollabResponse::Events {
                steps: events.steps,
                users: events.users,
            },
            Err(kind) => CollabResponse::Failure(kind),
        },
        CollabRequest::PushEvents {
            doc_name,
            version,
            steps,
            client_id,
            user_id,
            manager_id,
        } => match manager
            .push_events(&doc_name, version, steps, client_id, user_id, manager_id)
            .await
        {
            Ok(_) => CollabResponse::Pushed,
            Err(kind) => CollabResponse::Failure(kind),
        },
    }
}
