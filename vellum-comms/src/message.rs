//! Message envelopes routed by the bus.
//!
//! Three shapes of traffic exist, and the distinction is structural rather
//! than conventional: a [`Envelope::Broadcast`] has no destination field to
//! fill in badly, and a [`Envelope::Ping`] or [`Envelope::Pong`] cannot lack
//! one. Replies are correlated to requests by echoing the request's `id`.
//!
//! Envelopes are published as `Arc<Envelope<T>>`. The bus keys its duplicate
//! suppression on the `Arc` allocation, so re-publishing the same handle is
//! idempotent while a fresh envelope with identical content is a new message.

use std::sync::Arc;

use uuid::Uuid;

/// A bus address. Plain channel names, e.g. `"collab/manager"`.
pub type Address = String;

/// A routed message carrying a payload of type `T`.
#[derive(Debug)]
pub enum Envelope<T> {
    /// Addressed request. Answered by a [`Envelope::Pong`] with the same `id`.
    Ping {
        to: Address,
        from: Address,
        id: Uuid,
        body: T,
    },
    /// Addressed reply to a prior ping.
    Pong {
        to: Address,
        from: Address,
        id: Uuid,
        body: T,
    },
    /// Unaddressed fan-out delivered to every subscriber on the bus.
    Broadcast { from: Address, id: Uuid, body: T },
}

impl<T> Envelope<T> {
    /// Build a ping with a fresh correlation id.
    pub fn ping(to: impl Into<Address>, from: impl Into<Address>, body: T) -> Arc<Self> {
        Arc::new(Envelope::Ping {
            to: to.into(),
            from: from.into(),
            id: Uuid::new_v4(),
            body,
        })
    }

    /// Build a pong echoing `id` from the ping being answered.
    pub fn pong(to: impl Into<Address>, from: impl Into<Address>, id: Uuid, body: T) -> Arc<Self> {
        Arc::new(Envelope::Pong {
            to: to.into(),
            from: from.into(),
            id,
            body,
        })
    }

    /// Build a broadcast with a fresh id.
    pub fn broadcast(from: impl Into<Address>, body: T) -> Arc<Self> {
        Arc::new(Envelope::Broadcast {
            from: from.into(),
            id: Uuid::new_v4(),
            body,
        })
    }

    /// Correlation id of this envelope.
    pub fn id(&self) -> Uuid {
        match self {
            Envelope::Ping { id, .. } | Envelope::Pong { id, .. } | Envelope::Broadcast { id, .. } => *id,
        }
    }

    /// Address the envelope was sent from.
    pub fn sender(&self) -> &str {
        match self {
            Envelope::Ping { from, .. }
            | Envelope::Pong { from, .. }
            | Envelope::Broadcast { from, .. } => from,
        }
    }

    /// Destination address, if the envelope is addressed at all.
    pub fn destination(&self) -> Option<&str> {
        match self {
            Envelope::Ping { to, .. } | Envelope::Pong { to, .. } => Some(to),
            Envelope::Broadcast { .. } => None,
        }
    }

    pub fn body(&self) -> &T {
        match self {
            Envelope::Ping { body, .. }
            | Envelope::Pong { body, .. }
            | Envelope::Broadcast { body, .. } => body,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Envelope::Broadcast { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_carries_destination() {
        let env = Envelope::ping("server", "client-1", 42u32);
        assert_eq!(env.destination(), Some("server"));
        assert_eq!(env.sender(), "client-1");
        assert_eq!(*env.body(), 42);
        assert!(!env.is_broadcast());
    }

    #[test]
    fn test_pong_echoes_id() {
        let ping = Envelope::ping("server", "client-1", "req");
        let pong = Envelope::pong(ping.sender().to_string(), "server", ping.id(), "resp");
        assert_eq!(pong.id(), ping.id());
        assert_eq!(pong.destination(), Some("client-1"));
    }

    #[test]
    fn test_broadcast_has_no_destination() {
        let env = Envelope::broadcast("server", 7u8);
        assert_eq!(env.destination(), None);
        assert!(env.is_broadcast());
    }

    #[test]
    fn test_fresh_envelopes_get_distinct_ids() {
        let a = Envelope::broadcast("x", ());
        let b = Envelope::broadcast("x", ());
        assert_ne!(a.id(), b.id());
    }
}
