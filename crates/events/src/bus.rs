//! Event publishing/subscription abstraction (mechanics only).
//!
//! The notification sink is a pub/sub fan-out: each status change a
//! lifecycle machine makes is published once, and every registered listener
//! receives its own copy.
//!
//! Delivery guarantees, deliberately weak:
//!
//! - **At-least-once**: a listener may see the same transition twice (e.g.
//!   after a restart replays a sweep); listeners must be idempotent.
//! - **Per-id ordering is the producer's job**: the machines publish the
//!   transitions of a single order/prescription strictly in lifecycle order.
//!   Across different ids there is no ordering guarantee.
//! - **No persistence**: the bus distributes; the record stores are the
//!   source of truth.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to the notification stream.
///
/// Each subscription gets a copy of every notification published after it
/// was created (broadcast semantics). Intended for single-threaded
/// consumption; hand the subscription to one listener thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently queued without blocking.
    pub fn drain(&self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(m) = self.try_recv() {
            out.push(m);
        }
        out
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// Transport-agnostic: the engine ships with an in-memory implementation;
/// an email/push adapter would implement the same trait over its transport.
/// Publish failures are surfaced so callers can log them, but the machines
/// treat publication as fire-and-forget (the record store already holds the
/// new state).
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
