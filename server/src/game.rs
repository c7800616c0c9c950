use log::{debug, info};
use shared::{Action, CharacterId, ClientPayload, DeliveryMode, ServerPayload, SessionId, Turn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::SimulationError;
use crate::interfaces::{CharacterRecord, Simulation};
use crate::message::{ClientMessage, Outbox};
use crate::utils::lock;

/// The grid spans -WORLD_EXTENT..=WORLD_EXTENT on both axes
pub const WORLD_EXTENT: i32 = 50;
/// Turns after the last attack during which logout is refused
pub const COMBAT_LOCK_TURNS: Turn = 50;
pub const ATTACK_RANGE: i32 = 2;

const POSITION_CHANNEL: u8 = 1;
const CHAT_CHANNEL: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avatar {
    pub session: SessionId,
    pub character_id: CharacterId,
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub last_combat: Option<Turn>,
}

impl Avatar {
    fn distance_to(&self, other: &Avatar) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }
}

#[derive(Debug, Default)]
struct WorldState {
    turn: Turn,
    avatars: BTreeMap<SessionId, Avatar>,
    /// Avatars whose position changed since the last broadcast
    moved: BTreeSet<SessionId>,
}

/// Grid world used by the standalone server: avatars move one step per
/// action, attacks lock logout for a while, and chat reaches everyone in the
/// world.
#[derive(Debug, Default)]
pub struct InMemoryWorld {
    state: Mutex<WorldState>,
}

impl InMemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn avatar(&self, session: SessionId) -> Option<Avatar> {
        lock(&self.state).avatars.get(&session).cloned()
    }

    pub fn population(&self) -> usize {
        lock(&self.state).avatars.len()
    }

    fn broadcast(
        outbox: &Outbox,
        targets: &[SessionId],
        payload: &ServerPayload,
        delivery: DeliveryMode,
        channel: u8,
    ) {
        for &target in targets {
            if let Err(e) = outbox.send(target, payload.clone(), delivery, channel) {
                debug!("Dropping {} for session {}: {}", payload.kind(), target, e);
            }
        }
    }
}

impl Simulation for InMemoryWorld {
    fn on_new_turn(
        &self,
        turn: Turn,
        _elapsed: Duration,
        outbox: &Outbox,
    ) -> Result<(), SimulationError> {
        let (targets, updates) = {
            let mut state = lock(&self.state);
            state.turn = turn;
            let moved = std::mem::take(&mut state.moved);
            let updates: Vec<ServerPayload> = moved
                .iter()
                .filter_map(|session| state.avatars.get(session))
                .map(|avatar| ServerPayload::WorldUpdate {
                    character_id: avatar.character_id,
                    x: avatar.x,
                    y: avatar.y,
                })
                .collect();
            let targets: Vec<SessionId> = state.avatars.keys().copied().collect();
            (targets, updates)
        };

        for update in &updates {
            Self::broadcast(
                outbox,
                &targets,
                update,
                DeliveryMode::UnreliableSequenced,
                POSITION_CHANNEL,
            );
        }
        Ok(())
    }

    fn process_action(
        &self,
        message: &ClientMessage,
        _outbox: &Outbox,
    ) -> Result<(), SimulationError> {
        let ClientPayload::PlayerAction { action, .. } = &message.payload else {
            return Err(SimulationError::Rejected(format!(
                "{} is not a world action",
                message.payload.kind()
            )));
        };

        let mut state = lock(&self.state);
        let turn = state.turn;
        let attacker = state
            .avatars
            .get(&message.session)
            .cloned()
            .ok_or(SimulationError::NotInWorld(message.session))?;

        match action {
            Action::Move { dx, dy } => {
                let avatar = state
                    .avatars
                    .get_mut(&message.session)
                    .ok_or(SimulationError::NotInWorld(message.session))?;
                // One step per action on each axis
                avatar.x = (avatar.x + dx.signum()).clamp(-WORLD_EXTENT, WORLD_EXTENT);
                avatar.y = (avatar.y + dy.signum()).clamp(-WORLD_EXTENT, WORLD_EXTENT);
                state.moved.insert(message.session);
            }
            Action::Attack { target } => {
                let defender = state
                    .avatars
                    .values_mut()
                    .find(|a| a.character_id == *target)
                    .ok_or_else(|| SimulationError::Rejected(format!("no character {}", target)))?;
                if attacker.distance_to(defender) > ATTACK_RANGE {
                    return Err(SimulationError::Rejected(format!(
                        "character {} is out of range",
                        target
                    )));
                }
                defender.last_combat = Some(turn);
                if let Some(avatar) = state.avatars.get_mut(&message.session) {
                    avatar.last_combat = Some(turn);
                }
                debug!(
                    "Turn {}: character {} attacked character {}",
                    turn, attacker.character_id, target
                );
            }
        }
        Ok(())
    }

    fn is_logout_allowed(&self, session: SessionId) -> bool {
        let state = lock(&self.state);
        match state.avatars.get(&session).and_then(|a| a.last_combat) {
            Some(last) => state.turn >= last + COMBAT_LOCK_TURNS,
            None => true,
        }
    }

    fn on_character_logout(&self, session: SessionId, outbox: &Outbox) {
        let (left, targets) = {
            let mut state = lock(&self.state);
            state.moved.remove(&session);
            let left = state.avatars.remove(&session);
            let targets: Vec<SessionId> = state.avatars.keys().copied().collect();
            (left, targets)
        };

        if let Some(avatar) = left {
            info!(
                "Character {} ({}) left the world",
                avatar.character_id, avatar.name
            );
            Self::broadcast(
                outbox,
                &targets,
                &ServerPayload::CharacterLeft {
                    character_id: avatar.character_id,
                },
                DeliveryMode::ReliableOrdered,
                0,
            );
        }
    }

    fn enter_world(
        &self,
        session: SessionId,
        character: &CharacterRecord,
        _outbox: &Outbox,
    ) -> Result<(i32, i32), SimulationError> {
        let mut state = lock(&self.state);
        let id = character.summary.id;
        if state.avatars.values().any(|a| a.character_id == id) {
            return Err(SimulationError::AlreadyInWorld(id));
        }

        let avatar = Avatar {
            session,
            character_id: id,
            name: character.summary.name.clone(),
            x: character.x.clamp(-WORLD_EXTENT, WORLD_EXTENT),
            y: character.y.clamp(-WORLD_EXTENT, WORLD_EXTENT),
            last_combat: None,
        };
        let position = (avatar.x, avatar.y);
        info!(
            "Character {} ({}) entered the world at ({}, {})",
            id, avatar.name, avatar.x, avatar.y
        );
        state.avatars.insert(session, avatar);
        state.moved.insert(session);
        Ok(position)
    }

    fn chat(
        &self,
        session: SessionId,
        character_id: CharacterId,
        text: &str,
        outbox: &Outbox,
    ) -> Result<(), SimulationError> {
        let (from, targets) = {
            let state = lock(&self.state);
            let speaker = state
                .avatars
                .get(&session)
                .filter(|a| a.character_id == character_id)
                .ok_or(SimulationError::NotInWorld(session))?;
            (
                speaker.name.clone(),
                state.avatars.keys().copied().collect::<Vec<_>>(),
            )
        };

        Self::broadcast(
            outbox,
            &targets,
            &ServerPayload::Chat {
                from,
                text: text.to_string(),
            },
            DeliveryMode::ReliableOrdered,
            CHAT_CHANNEL,
        );
        Ok(())
    }
}
