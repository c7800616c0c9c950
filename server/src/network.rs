//! UDP transport: one connection per remote address.
//!
//! The receiver task opens a session for every new address and feeds raw
//! datagrams into the inbound queue. The reaper task closes connections that
//! went silent or whose disconnect grace period ran out. Sends are
//! non-blocking `try_send_to` calls so the transport can be driven from any
//! tier.

use log::{debug, error, info, warn};
use shared::{encode_server_frame_into, ConnectionId, DeliveryMode, ServerPayload, SessionId, MAX_FRAME_SIZE};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::error::TransportError;
use crate::interfaces::Transport;
use crate::message::RawFrame;
use crate::queues::QueueHub;
use crate::sessions::SessionTable;
use crate::utils::lock;
use crate::workers::WorkerToken;

const REAP_INTERVAL: Duration = Duration::from_millis(250);
const RECEIVE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Connection {
    addr: SocketAddr,
    session: SessionId,
    last_seen: Instant,
    /// Set by a disconnect; the connection closes at this instant
    closing_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Connections {
    by_id: HashMap<ConnectionId, Connection>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
}

impl Connections {
    fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.by_id.remove(&id)?;
        if self.by_addr.get(&connection.addr) == Some(&id) {
            self.by_addr.remove(&connection.addr);
        }
        Some(connection)
    }
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    connections: Mutex<Connections>,
    next_id: AtomicU64,
    connection_timeout: Duration,
}

impl UdpTransport {
    pub async fn bind(addr: &str, connection_timeout: Duration) -> Result<Arc<Self>, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Listening on {}", socket.local_addr()?);
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            connections: Mutex::new(Connections::default()),
            next_id: AtomicU64::new(1),
            connection_timeout,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).by_id.len()
    }

    /// Spawns the task that receives datagrams and queues them for the
    /// dispatcher.
    pub fn spawn_receiver(
        self: &Arc<Self>,
        hub: Arc<QueueHub>,
        sessions: Arc<SessionTable>,
        token: WorkerToken,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            // Oversized datagrams must reach the decoder whole enough to be rejected.
            let mut buffer = vec![0u8; MAX_FRAME_SIZE * 2];

            while token.is_running() {
                let received =
                    match tokio::time::timeout(RECEIVE_POLL, transport.socket.recv_from(&mut buffer)).await {
                        Ok(received) => received,
                        Err(_) => continue,
                    };

                match received {
                    Ok((len, addr)) => {
                        let session = transport.session_for(addr, &sessions);
                        let frame = RawFrame::new(session, buffer[..len].to_vec());
                        if let Err(e) = hub.inbound().push(frame) {
                            warn!("Dropping datagram from {}: {}", addr, e);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
            debug!("Receiver stopped");
        })
    }

    /// Spawns the task that closes silent connections and connections whose
    /// disconnect grace period has passed.
    pub fn spawn_reaper(self: &Arc<Self>, token: WorkerToken) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(REAP_INTERVAL);
            while token.is_running() {
                ticker.tick().await;
                transport.reap(Instant::now());
            }
            debug!("Reaper stopped");
        })
    }

    /// Closes expired connections and returns their ids.
    pub fn reap(&self, now: Instant) -> Vec<ConnectionId> {
        let mut connections = lock(&self.connections);
        let expired: Vec<ConnectionId> = connections
            .by_id
            .iter()
            .filter(|(_, c)| match c.closing_at {
                Some(at) => now >= at,
                None => now.duration_since(c.last_seen) > self.connection_timeout,
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(connection) = connections.remove(*id) {
                info!(
                    "Connection {} ({}) closed for session {}",
                    id, connection.addr, connection.session
                );
            }
        }
        expired
    }

    fn session_for(&self, addr: SocketAddr, sessions: &SessionTable) -> SessionId {
        let mut connections = lock(&self.connections);
        if let Some(id) = connections.by_addr.get(&addr).copied() {
            if let Some(connection) = connections.by_id.get_mut(&id) {
                connection.last_seen = Instant::now();
                return connection.session;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = sessions.open(id);
        info!("Connection {} from {} (session {})", id, addr, session);
        connections.by_id.insert(
            id,
            Connection {
                addr,
                session,
                last_seen: Instant::now(),
                closing_at: None,
            },
        );
        connections.by_addr.insert(addr, id);
        session
    }

    fn addr_of(&self, connection: ConnectionId) -> Option<SocketAddr> {
        lock(&self.connections).by_id.get(&connection).map(|c| c.addr)
    }
}

impl Transport for UdpTransport {
    fn is_connected(&self, connection: ConnectionId) -> bool {
        lock(&self.connections).by_id.contains_key(&connection)
    }

    fn send(
        &self,
        connection: ConnectionId,
        frame: &[u8],
        _delivery: DeliveryMode,
        _channel: u8,
    ) -> Result<(), TransportError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        let addr = self
            .addr_of(connection)
            .ok_or(TransportError::Closed(connection))?;
        self.socket.try_send_to(frame, addr)?;
        Ok(())
    }

    fn disconnect(&self, connection: ConnectionId, reason: &str, grace: Duration) {
        let mut notice = Vec::new();
        let payload = ServerPayload::Disconnected {
            reason: reason.to_string(),
        };
        if let Err(e) = encode_server_frame_into(&mut notice, 0, &payload) {
            warn!("Could not encode disconnect notice: {}", e);
        } else if let Err(e) = self.send(connection, &notice, DeliveryMode::ReliableOrdered, 0) {
            debug!("Disconnect notice to connection {} not sent: {}", connection, e);
        }

        let mut connections = lock(&self.connections);
        if grace.is_zero() {
            connections.remove(connection);
        } else if let Some(c) = connections.by_id.get_mut(&connection) {
            if c.closing_at.is_none() {
                c.closing_at = Some(Instant::now() + grace);
            }
        }
        debug!(
            "Connection {} closing in {:?}: {}",
            connection, grace, reason
        );
    }
}
