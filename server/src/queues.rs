//! The queue hub: every queue the pipeline uses, owned by one instance that
//! is handed to each component at construction.
//!
//! ## Work queues
//! [`WorkQueue`] is a FIFO with a wake signal. `push` appends and wakes one
//! waiter; `pop` never blocks. Consumers loop on `pop` until empty, then
//! [`WorkQueue::wait`] with a timeout so a stop request is noticed even when
//! no traffic arrives. A pop hands the item to exactly one consumer.
//!
//! ## Action queue
//! [`ActionQueue`] is double-buffered. Dispatchers append to the write
//! buffer; the turn scheduler calls [`ActionQueue::swap`], which exchanges
//! the buffers under the same lock writers take, so a drain sees every
//! message enqueued before the swap and none enqueued after it.
//!
//! ## Capacity
//! Every queue shares one capacity (0 means unbounded). A push beyond it
//! fails with [`QueueError::Full`] and the item is dropped by the caller.

use shared::QueueSample;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::QueueError;
use crate::message::{ClientMessage, InterServerMessage, OutboundMessage, RawFrame};
use crate::utils::lock;

#[derive(Debug)]
pub struct WorkQueue<T> {
    name: &'static str,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    signal: Notify,
}

impl<T> WorkQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            items: Mutex::new(VecDeque::new()),
            signal: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn push(&self, item: T) -> Result<(), QueueError> {
        {
            let mut items = lock(&self.items);
            if self.capacity > 0 && items.len() >= self.capacity {
                return Err(QueueError::Full {
                    queue: self.name,
                    capacity: self.capacity,
                });
            }
            items.push_back(item);
        }
        self.signal.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        lock(&self.items).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    /// Future resolving on the next push (or immediately if a push happened
    /// since the last wake-up).
    pub fn notified(&self) -> Notified<'_> {
        self.signal.notified()
    }

    /// Waits for a push or the timeout. Returns true if woken by a push.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.signal.notified())
            .await
            .is_ok()
    }
}

#[derive(Debug, Default)]
struct ActionBuffers {
    write: Vec<ClientMessage>,
    spare: Vec<ClientMessage>,
}

/// Double-buffered queue of in-world actions awaiting the next turn.
#[derive(Debug)]
pub struct ActionQueue {
    capacity: usize,
    buffers: Mutex<ActionBuffers>,
}

impl ActionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: Mutex::new(ActionBuffers::default()),
        }
    }

    /// Appends to the write buffer.
    pub fn write_enqueue(&self, message: ClientMessage) -> Result<(), QueueError> {
        let mut buffers = lock(&self.buffers);
        if self.capacity > 0 && buffers.write.len() >= self.capacity {
            return Err(QueueError::Full {
                queue: "action",
                capacity: self.capacity,
            });
        }
        buffers.write.push(message);
        Ok(())
    }

    /// Exchanges the buffers and returns everything written so far, in
    /// enqueue order. Hand the vector back through [`ActionQueue::recycle`]
    /// once drained to reuse its allocation.
    pub fn swap(&self) -> Vec<ClientMessage> {
        let mut buffers = lock(&self.buffers);
        let spare = std::mem::take(&mut buffers.spare);
        std::mem::replace(&mut buffers.write, spare)
    }

    pub fn recycle(&self, mut drained: Vec<ClientMessage>) {
        drained.clear();
        let mut buffers = lock(&self.buffers);
        if buffers.spare.capacity() < drained.capacity() {
            buffers.spare = drained;
        }
    }

    /// Messages waiting in the write buffer.
    pub fn len(&self) -> usize {
        lock(&self.buffers).write.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns the five logical queues plus the outbound queue.
#[derive(Debug)]
pub struct QueueHub {
    inbound: WorkQueue<RawFrame>,
    actions: ActionQueue,
    character: WorkQueue<ClientMessage>,
    chat: WorkQueue<ClientMessage>,
    inter_server: WorkQueue<InterServerMessage>,
    outbound: WorkQueue<OutboundMessage>,
}

impl QueueHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inbound: WorkQueue::new("inbound", capacity),
            actions: ActionQueue::new(capacity),
            character: WorkQueue::new("character", capacity),
            chat: WorkQueue::new("chat", capacity),
            inter_server: WorkQueue::new("inter-server", capacity),
            outbound: WorkQueue::new("outbound", capacity),
        }
    }

    pub fn inbound(&self) -> &WorkQueue<RawFrame> {
        &self.inbound
    }

    pub fn actions(&self) -> &ActionQueue {
        &self.actions
    }

    pub fn character(&self) -> &WorkQueue<ClientMessage> {
        &self.character
    }

    pub fn chat(&self) -> &WorkQueue<ClientMessage> {
        &self.chat
    }

    pub fn inter_server(&self) -> &WorkQueue<InterServerMessage> {
        &self.inter_server
    }

    pub fn outbound(&self) -> &WorkQueue<OutboundMessage> {
        &self.outbound
    }

    pub fn sample(&self) -> QueueSample {
        QueueSample {
            inbound: self.inbound.len(),
            actions: self.actions.len(),
            character: self.character.len(),
            chat: self.chat.len(),
            inter_server: self.inter_server.len(),
            outbound: self.outbound.len(),
        }
    }
}
