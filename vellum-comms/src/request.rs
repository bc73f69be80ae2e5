//! Request/response correlation on top of the bus.
//!
//! [`request`] publishes a ping and waits for the pong that echoes its id,
//! with a deadline. The reply subscription lives in a guard local to the
//! call, so it is removed on success, on timeout, and when the caller's
//! future is dropped mid-flight. Nothing dangles.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::bus::{Handler, MessageBus};
use crate::message::{Address, Envelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// No reply arrived before the deadline.
    Timeout,
    /// The bus was destroyed; no request can ever complete.
    BusDestroyed,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Timeout => write!(f, "request timed out"),
            RequestError::BusDestroyed => write!(f, "bus destroyed"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Send `body` to `to` and wait up to `deadline` for the correlated reply,
/// listening at `from`.
pub async fn request<T>(
    bus: &MessageBus<T>,
    to: impl Into<Address>,
    from: impl Into<Address>,
    body: T,
    deadline: Duration,
) -> Result<T, RequestError>
where
    T: Clone + Send + Sync + 'static,
{
    if bus.is_destroyed() {
        return Err(RequestError::BusDestroyed);
    }
    let from = from.into();
    let ping = Envelope::ping(to, from.clone(), body);
    let id = ping.id();

    let (reply_tx, reply_rx) = oneshot::channel();
    let reply_slot = Mutex::new(Some(reply_tx));
    let handler: Handler<T> = Arc::new(move |envelope| {
        if let Envelope::Pong {
            id: reply_id, body, ..
        } = &**envelope
        {
            if *reply_id == id {
                if let Some(tx) = reply_slot.lock().ok().and_then(|mut slot| slot.take()) {
                    let _ = tx.send(body.clone());
                }
            }
        }
    });

    // Guard scope covers the await below, so the route is gone on every exit
    // path, including cancellation.
    let _subscription = bus.subscribe(from, handler);
    bus.publish(ping);

    match tokio::time::timeout(deadline, reply_rx).await {
        Ok(Ok(body)) => Ok(body),
        Ok(Err(_)) => Err(RequestError::BusDestroyed),
        Err(_) => {
            log::debug!("request {id} timed out after {deadline:?}");
            Err(RequestError::Timeout)
        }
    }
}

/// Publish the pong answering `ping_id` back to `to`.
pub fn respond<T>(
    bus: &MessageBus<T>,
    to: impl Into<Address>,
    from: impl Into<Address>,
    ping_id: Uuid,
    body: T,
) where
    T: Send + Sync + 'static,
{
    bus.publish(Envelope::pong(to, from, ping_id, body));
}
