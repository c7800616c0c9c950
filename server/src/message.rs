//! Messages flowing through the queue hub.
//!
//! Three kinds: client to server ([`ClientMessage`]), server to client
//! ([`OutboundMessage`], pooled), and server to server
//! ([`InterServerMessage`]). Raw transport frames ([`RawFrame`]) become one
//! of the first or the last after decoding.

use log::warn;
use shared::{
    encode_server_frame_into, ClientPayload, DeliveryMode, InterServerPayload, ServerPayload,
    SessionId, Turn,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::QueueError;
use crate::message_pool::{MessagePool, PooledBuffer};
use crate::queues::QueueHub;
use crate::scheduler::TurnCounter;

/// Undecoded datagram from the transport.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub session: SessionId,
    pub bytes: Vec<u8>,
    pub received_at: Instant,
}

impl RawFrame {
    pub fn new(session: SessionId, bytes: Vec<u8>) -> Self {
        Self {
            session,
            bytes,
            received_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub session: SessionId,
    pub payload: ClientPayload,
    /// Turn in progress when the message was decoded
    pub turn: Turn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterServerMessage {
    /// Session of the peer link the message arrived on
    pub origin: SessionId,
    pub payload: InterServerPayload,
    pub turn: Turn,
}

/// Connection close the sender performs once the carrying message has been
/// handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseAfter {
    pub reason: String,
    pub grace: Duration,
}

/// Server to client message. Owns a pooled encode buffer that returns to the
/// pool when the message is dropped.
#[derive(Debug)]
pub struct OutboundMessage {
    pub target: SessionId,
    pub payload: ServerPayload,
    pub delivery: DeliveryMode,
    pub channel: u8,
    pub turn: Turn,
    pub close_after: Option<CloseAfter>,
    buffer: PooledBuffer,
}

impl OutboundMessage {
    pub fn new(
        buffer: PooledBuffer,
        target: SessionId,
        payload: ServerPayload,
        delivery: DeliveryMode,
        channel: u8,
        turn: Turn,
    ) -> Self {
        Self {
            target,
            payload,
            delivery,
            channel,
            turn,
            close_after: None,
            buffer,
        }
    }

    /// Encodes the frame into the pooled buffer and returns the bytes.
    pub fn encode(&mut self) -> Result<&[u8], bincode::Error> {
        let buf = self.buffer.get_mut().ok_or_else(|| {
            Box::new(bincode::ErrorKind::Custom(
                "encode buffer already released".to_string(),
            ))
        })?;
        encode_server_frame_into(buf, self.turn, &self.payload)?;
        Ok(self.buffer.bytes())
    }

    pub fn is_released(&self) -> bool {
        self.buffer.is_released()
    }
}

/// Producer handle for the outbound queue.
///
/// Stamps every message with the turn in progress and draws its buffer from
/// the pool. Cloned into every component that replies to clients.
#[derive(Clone)]
pub struct Outbox {
    hub: Arc<QueueHub>,
    pool: Arc<MessagePool>,
    turns: Arc<TurnCounter>,
}

impl Outbox {
    pub fn new(hub: Arc<QueueHub>, pool: Arc<MessagePool>, turns: Arc<TurnCounter>) -> Self {
        Self { hub, pool, turns }
    }

    pub fn send(
        &self,
        target: SessionId,
        payload: ServerPayload,
        delivery: DeliveryMode,
        channel: u8,
    ) -> Result<(), QueueError> {
        self.hub
            .outbound()
            .push(self.message(target, payload, delivery, channel))
    }

    fn message(
        &self,
        target: SessionId,
        payload: ServerPayload,
        delivery: DeliveryMode,
        channel: u8,
    ) -> OutboundMessage {
        OutboundMessage::new(
            self.pool.acquire(),
            target,
            payload,
            delivery,
            channel,
            self.turns.current(),
        )
    }

    /// Reliable-ordered on channel 0: the exit contract for every reply.
    pub fn reply(&self, target: SessionId, payload: ServerPayload) -> Result<(), QueueError> {
        self.send(target, payload, DeliveryMode::ReliableOrdered, 0)
    }

    /// Like [`Outbox::reply`], logging instead of returning a full queue.
    pub fn reply_or_log(&self, target: SessionId, payload: ServerPayload) {
        let kind = payload.kind();
        if let Err(e) = self.reply(target, payload) {
            warn!("Dropping {} reply to session {}: {}", kind, target, e);
        }
    }

    /// Queues a final reply. The sender closes the connection with `reason`
    /// right after transmitting it, so the peer sees the reply before the
    /// disconnect notice.
    pub fn reply_then_close(
        &self,
        target: SessionId,
        payload: ServerPayload,
        reason: &str,
        grace: Duration,
    ) -> Result<(), QueueError> {
        let mut message = self.message(target, payload, DeliveryMode::ReliableOrdered, 0);
        message.close_after = Some(CloseAfter {
            reason: reason.to_string(),
            grace,
        });
        self.hub.outbound().push(message)
    }

    pub fn current_turn(&self) -> Turn {
        self.turns.current()
    }
}
