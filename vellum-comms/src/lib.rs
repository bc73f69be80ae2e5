//! In-process messaging primitives for the vellum collaboration stack.
//!
//! Everything above this crate talks through a [`MessageBus`]: an addressed
//! pub/sub router with broadcast fan-out, duplicate suppression, and optional
//! artificial latency for tests. [`request`] layers request/response
//! correlation on top so callers get plain `async fn` semantics with a
//! timeout instead of hand-wiring reply channels.
//!
//! ```text
//!   client comm ──ping──►  ┌────────────┐  ──ping──►  manager comm
//!                          │ MessageBus │
//!   client comm ◄──pong──  │  (routes)  │  ◄─bcast──  manager comm
//!                          └────────────┘
//! ```
//!
//! The bus is intentionally transport-shaped: swapping it for a socket later
//! means replacing this crate, not the protocol types that ride on it.

pub mod bus;
pub mod message;
pub mod request;

pub use bus::{Handler, MessageBus, Subscription};
pub use message::{Address, Envelope};
pub use request::{request, respond, RequestError};
