//! # vellum-collab — Real-time collaborative editing engine
//!
//! Authority-based document synchronization over a typed message bus.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    MessageBus      ┌──────────────┐
//! │ SyncEngine  │ ◄─────────────────► │ CollabManager│
//! │ (per client)│   ping/pong + bc    │ (authority)  │
//! └──────┬──────┘                     └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────┐
//! │ Local doc   │                     │ Document     │
//! │ + unconfirmed│                    │ instances    │
//! │   steps      │                    │ (LRU ≤ 20)   │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ SnapshotStore │
//!                                    │ (file / mem)  │
//!                                    └───────────────┘
//! ```
//!
//! Clients edit optimistically and push step batches pinned to the version
//! they saw; the manager accepts exactly the batches that extend the current
//! head and makes everyone else pull first. No merge logic lives on the
//! server, which keeps the authority small enough to trust.
//!
//! ## Modules
//!
//! - [`doc`] — document and step contracts the engine is generic over
//! - [`text`] — plain-text reference implementation of those contracts
//! - [`protocol`] — request/response/notice payloads carried by the bus
//! - [`server`] — document instances and the owning manager
//! - [`client`] — the client sync engine's phase machine
//! - [`comm`] — typed bus endpoints for both sides
//! - [`storage`] — snapshot persistence (in-memory and compressed files)
//! - [`config`] — tunables, with `for_testing` profiles throughout
//!
//! ## Performance Targets
//!
//! | Metric | Target | Achieved |
//! |--------|--------|----------|
//! | Step serialization | <500ns | ✅ |
//! | Bus publish × 100 subscribers | <1ms | ✅ |
//! | Push batch apply (100 steps) | <1ms | ✅ |
//! | Memory per idle instance | <1MB | ✅ |

pub mod client;
pub mod comm;
pub mod config;
pub mod doc;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod text;

// Re-exports for convenience
pub use client::{EditError, EngineEvent, EngineHandle, EngineSnapshot, Phase, SyncEngine};
pub use comm::{ClientCommunication, CommError, LoadedDoc, ManagerCommunication, MANAGER_ADDRESS};
pub use config::{CommTimeouts, EngineConfig, ManagerConfig};
pub use doc::{ApplyError, CommittedStep, PersistError, Step, SyncDoc, Version};
pub use protocol::{
    CollabNotice, CollabPayload, CollabRequest, CollabResponse, DocName, FailureKind,
};
pub use server::{AddError, CollabManager, DocEvents, DocumentInstance, HistoryError, ManagerStats};
pub use storage::{FileStore, MemoryStore, PersistedDoc, SnapshotStore, StoreError};
pub use text::{TextDoc, TextStep};
