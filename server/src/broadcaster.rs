//! Persist-then-broadcast handling of live room updates
//!
//! Every update moves through `received → persisted → broadcast`, or stops at
//! `failed`. Validation happens before the store is touched. Only once the
//! store has acknowledged the write is the new value fanned out to the other
//! members of the room, so a peer that sees a broadcast and then reads the run
//! gets at least that value back. When anything fails, the originating
//! connection alone receives an `Error` packet and nobody else hears about it.
//!
//! Writes are full replacements. Two updates for the same player that race
//! each other are not merged: the one the store applies last wins.

use crate::error::SyncError;
use crate::room_registry::{ConnectionId, RoomRegistry};
use crate::store::RunStore;
use log::{debug, error, warn};
use shared::{Packet, PlayerSlot, Progress};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Result of a broadcast that made it past persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub recipients: usize,
}

pub struct RoomBroadcaster {
    store: Arc<dyn RunStore>,
    registry: Arc<RwLock<RoomRegistry>>,
}

impl RoomBroadcaster {
    pub fn new(store: Arc<dyn RunStore>, registry: Arc<RwLock<RoomRegistry>>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Replaces one player's progress and tells the rest of the room.
    pub async fn update_player_progress(
        &self,
        origin: ConnectionId,
        room_id: &str,
        player: u8,
        progress: &[u32],
    ) -> Result<Delivery, SyncError> {
        debug!("Room {}: player progress update received from {}", room_id, origin);
        let outcome = self.persist_player_progress(room_id, player, progress).await;
        self.publish(origin, room_id, outcome, "Failed to update player progress")
            .await
    }

    pub async fn update_mode(
        &self,
        origin: ConnectionId,
        room_id: &str,
        two_player_mode: bool,
    ) -> Result<Delivery, SyncError> {
        debug!("Room {}: mode update received from {}", room_id, origin);
        let outcome = self
            .store
            .update_mode(room_id, two_player_mode)
            .await
            .map(|()| Packet::ModeUpdated { two_player_mode })
            .map_err(SyncError::from);
        self.publish(origin, room_id, outcome, "Failed to update mode")
            .await
    }

    /// Board-wide progress shared by everyone in single-player mode.
    pub async fn update_progress(
        &self,
        origin: ConnectionId,
        room_id: &str,
        progress: &[u32],
    ) -> Result<Delivery, SyncError> {
        debug!("Room {}: progress update received from {}", room_id, origin);
        let outcome = self.persist_progress(room_id, progress).await;
        self.publish(origin, room_id, outcome, "Failed to update progress")
            .await
    }

    async fn persist_player_progress(
        &self,
        room_id: &str,
        player: u8,
        progress: &[u32],
    ) -> Result<Packet, SyncError> {
        let player = PlayerSlot::from_number(i64::from(player))?;
        let progress = Progress::from_wire(progress)?;
        self.store
            .update_player_progress(room_id, player, progress.clone())
            .await?;
        Ok(Packet::PlayerProgressUpdated { player, progress })
    }

    async fn persist_progress(&self, room_id: &str, progress: &[u32]) -> Result<Packet, SyncError> {
        let progress = Progress::from_wire(progress)?;
        self.store.update_progress(room_id, progress.clone()).await?;
        Ok(Packet::ProgressUpdated { progress })
    }

    async fn publish(
        &self,
        origin: ConnectionId,
        room_id: &str,
        outcome: Result<Packet, SyncError>,
        failure: &str,
    ) -> Result<Delivery, SyncError> {
        let registry = self.registry.read().await;
        match outcome {
            Ok(packet) => {
                debug!("Room {}: update from {} persisted", room_id, origin);
                let recipients = registry.fan_out(room_id, Some(origin), &packet);
                debug!("Room {}: broadcast to {} member(s)", room_id, recipients);
                Ok(Delivery { recipients })
            }
            Err(err) => {
                match &err {
                    SyncError::Persistence(cause) => {
                        error!("Room {}: {}: {}", room_id, failure, cause)
                    }
                    other => warn!("Room {}: rejected update from {}: {}", room_id, origin, other),
                }
                let message = err.public_message(failure);
                registry.send_to(origin, Packet::Error { message });
                Err(err)
            }
        }
    }
}
