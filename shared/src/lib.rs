//! Wire protocol shared by the world server, its peers, and clients.
//!
//! Every datagram a client or peer sends is one bincode-encoded [`WireFrame`].
//! Every datagram the server sends is one bincode-encoded [`ServerFrame`],
//! stamped with the turn during which it was produced.

use serde::{Deserialize, Serialize};

pub type SessionId = u64;
pub type ConnectionId = u64;
pub type AccountId = u64;
pub type CharacterId = u64;
pub type Turn = u64;

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest datagram either side will accept.
pub const MAX_FRAME_SIZE: usize = 2048;

/// How the transport should deliver a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    Unreliable,
    UnreliableSequenced,
    ReliableUnordered,
    ReliableSequenced,
    ReliableOrdered,
}

impl DeliveryMode {
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryMode::ReliableUnordered
                | DeliveryMode::ReliableSequenced
                | DeliveryMode::ReliableOrdered
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Move { dx: i32, dy: i32 },
    Attack { target: CharacterId },
}

/// Client to server requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientPayload {
    Handshake {
        account_id: AccountId,
        secret: String,
        client_version: u32,
    },
    ListCharacters,
    CreateCharacter {
        name: String,
    },
    DeleteCharacter {
        character_id: CharacterId,
    },
    StartCharacter {
        character_id: CharacterId,
    },
    PlayerAction {
        character_id: CharacterId,
        action: Action,
    },
    Chat {
        character_id: CharacterId,
        text: String,
    },
    /// `exit_client` asks to leave the server entirely; otherwise the session
    /// returns to character selection.
    Logout {
        character_id: Option<CharacterId>,
        exit_client: bool,
    },
}

impl ClientPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientPayload::Handshake { .. } => "handshake",
            ClientPayload::ListCharacters => "list-characters",
            ClientPayload::CreateCharacter { .. } => "create-character",
            ClientPayload::DeleteCharacter { .. } => "delete-character",
            ClientPayload::StartCharacter { .. } => "start-character",
            ClientPayload::PlayerAction { .. } => "player-action",
            ClientPayload::Chat { .. } => "chat",
            ClientPayload::Logout { .. } => "logout",
        }
    }

    /// Character id embedded by in-world messages.
    pub fn character_id(&self) -> Option<CharacterId> {
        match self {
            ClientPayload::PlayerAction { character_id, .. }
            | ClientPayload::Chat { character_id, .. } => Some(*character_id),
            ClientPayload::Logout { character_id, .. } => *character_id,
            _ => None,
        }
    }

    /// Requests legal while the session sits at character selection.
    pub fn is_character_management(&self) -> bool {
        matches!(
            self,
            ClientPayload::ListCharacters
                | ClientPayload::CreateCharacter { .. }
                | ClientPayload::DeleteCharacter { .. }
                | ClientPayload::StartCharacter { .. }
                | ClientPayload::Logout { .. }
        )
    }
}

/// Server to server traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterServerPayload {
    /// One-time secret the login service issued for an account.
    CredentialToken { account_id: AccountId, token: String },
    StatusProbe,
}

/// Inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireFrame {
    Client(ClientPayload),
    Peer {
        secret: String,
        payload: InterServerPayload,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterSummary {
    pub id: CharacterId,
    pub name: String,
    pub level: u32,
}

/// Queue depths at one instant. May be stale by the time it is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSample {
    pub inbound: usize,
    pub actions: usize,
    pub character: usize,
    pub chat: usize,
    pub inter_server: usize,
    pub outbound: usize,
}

impl QueueSample {
    pub fn total(&self) -> usize {
        self.inbound + self.actions + self.character + self.chat + self.inter_server + self.outbound
    }
}

/// Self-description returned to status probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub protocol_version: u32,
    pub turn: Turn,
    pub sessions: usize,
    pub in_world: usize,
    pub uptime_secs: u64,
    pub queues: QueueSample,
}

/// Server to client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerPayload {
    CharacterList {
        characters: Vec<CharacterSummary>,
    },
    CharacterCreated {
        character: CharacterSummary,
    },
    CreateFailed {
        reason: String,
    },
    CharacterDeleted {
        character_id: CharacterId,
    },
    DeleteFailed {
        reason: String,
    },
    StartFailed {
        reason: String,
    },
    EnterWorld {
        character: CharacterSummary,
        x: i32,
        y: i32,
    },
    WorldUpdate {
        character_id: CharacterId,
        x: i32,
        y: i32,
    },
    CharacterLeft {
        character_id: CharacterId,
    },
    Chat {
        from: String,
        text: String,
    },
    LogoutConfirmed {
        exit_client: bool,
    },
    Status(ServerStatus),
    Disconnected {
        reason: String,
    },
}

impl ServerPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerPayload::CharacterList { .. } => "character-list",
            ServerPayload::CharacterCreated { .. } => "character-created",
            ServerPayload::CreateFailed { .. } => "create-failed",
            ServerPayload::CharacterDeleted { .. } => "character-deleted",
            ServerPayload::DeleteFailed { .. } => "delete-failed",
            ServerPayload::StartFailed { .. } => "start-failed",
            ServerPayload::EnterWorld { .. } => "enter-world",
            ServerPayload::WorldUpdate { .. } => "world-update",
            ServerPayload::CharacterLeft { .. } => "character-left",
            ServerPayload::Chat { .. } => "chat",
            ServerPayload::LogoutConfirmed { .. } => "logout-confirmed",
            ServerPayload::Status(_) => "status",
            ServerPayload::Disconnected { .. } => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub turn: Turn,
    pub payload: ServerPayload,
}

// Serializes exactly like `ServerFrame` without cloning the payload.
#[derive(Serialize)]
struct ServerFrameRef<'a> {
    turn: Turn,
    payload: &'a ServerPayload,
}

fn size_limit_error() -> bincode::Error {
    Box::new(bincode::ErrorKind::SizeLimit)
}

pub fn encode_frame(frame: &WireFrame) -> Result<Vec<u8>, bincode::Error> {
    let data = bincode::serialize(frame)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(size_limit_error());
    }
    Ok(data)
}

pub fn decode_frame(data: &[u8]) -> Result<WireFrame, bincode::Error> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(size_limit_error());
    }
    bincode::deserialize(data)
}

/// Encodes a server frame into `buf`, replacing its contents.
pub fn encode_server_frame_into(
    buf: &mut Vec<u8>,
    turn: Turn,
    payload: &ServerPayload,
) -> Result<(), bincode::Error> {
    buf.clear();
    bincode::serialize_into(&mut *buf, &ServerFrameRef { turn, payload })?;
    if buf.len() > MAX_FRAME_SIZE {
        buf.clear();
        return Err(size_limit_error());
    }
    Ok(())
}

pub fn decode_server_frame(data: &[u8]) -> Result<ServerFrame, bincode::Error> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(size_limit_error());
    }
    bincode::deserialize(data)
}
