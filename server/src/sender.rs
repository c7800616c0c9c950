//! Outbound sender (tier 4): drains the outbound queue onto the transport.
//!
//! A message is attempted once. Whatever the outcome, it is dropped at the
//! end of [`OutboundSender::send`], which returns its buffer to the pool.
//! Retransmission of reliable traffic belongs to the transport.

use log::{debug, warn};
use shared::ConnectionId;
use std::sync::Arc;
use std::time::Duration;

use crate::interfaces::Transport;
use crate::message::OutboundMessage;
use crate::queues::QueueHub;
use crate::sessions::SessionTable;
use crate::workers::{guarded, WorkerToken, YIELD_EVERY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    UnknownSession,
    NotConnected,
    EncodeFailed,
    TransportFailed,
}

pub struct OutboundSender {
    hub: Arc<QueueHub>,
    sessions: Arc<SessionTable>,
    transport: Arc<dyn Transport>,
    idle_wait: Duration,
}

impl OutboundSender {
    pub fn new(
        hub: Arc<QueueHub>,
        sessions: Arc<SessionTable>,
        transport: Arc<dyn Transport>,
        idle_wait: Duration,
    ) -> Self {
        Self {
            hub,
            sessions,
            transport,
            idle_wait,
        }
    }

    pub async fn run_worker(self: Arc<Self>, token: WorkerToken) {
        debug!("Sender worker {} started", token.id());
        while token.is_running() {
            let mut drained = 0usize;
            while let Some(message) = self.hub.outbound().pop() {
                let target = message.target;
                if guarded("sender", || self.send(message)).is_none() {
                    warn!("Session {}: outbound message lost to a sender panic", target);
                }
                if !token.is_running() {
                    break;
                }
                drained += 1;
                if drained % YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
            }
            self.hub.outbound().wait(self.idle_wait).await;
        }
        debug!("Sender worker {} stopped", token.id());
    }

    /// Transmits one message. Consumes it, so its buffer is back in the pool
    /// when this returns. A message carrying a close instruction closes the
    /// connection after the transmission attempt, whatever its outcome.
    pub fn send(&self, mut message: OutboundMessage) -> SendOutcome {
        let close_after = message.close_after.take();
        let Some(connection) = self.sessions.with(message.target, |s| s.connection) else {
            debug!(
                "Dropping {} for evicted session {}",
                message.payload.kind(),
                message.target
            );
            return SendOutcome::UnknownSession;
        };

        let outcome = self.transmit(connection, message);
        if let Some(close) = close_after {
            self.transport
                .disconnect(connection, &close.reason, close.grace);
        }
        outcome
    }

    fn transmit(&self, connection: ConnectionId, mut message: OutboundMessage) -> SendOutcome {
        if !self.transport.is_connected(connection) {
            debug!(
                "Dropping {} for session {}: connection {} closed",
                message.payload.kind(),
                message.target,
                connection
            );
            return SendOutcome::NotConnected;
        }

        let (delivery, channel, target, kind) = (
            message.delivery,
            message.channel,
            message.target,
            message.payload.kind(),
        );
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Session {}: could not encode {}: {}", target, kind, e);
                return SendOutcome::EncodeFailed;
            }
        };

        match self.transport.send(connection, frame, delivery, channel) {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                warn!("Session {}: sending {} failed: {}", target, kind, e);
                SendOutcome::TransportFailed
            }
        }
    }
}
