//! Client side of the sync protocol: the phase-machine engine that keeps a
//! local replica converging with the manager.

pub mod engine;

pub use engine::{
    EditError, EngineEvent, EngineHandle, EngineSnapshot, Phase, SyncEngine,
};
