//! One worker task per active room
//!
//! Updates arriving over the real-time channel are queued on their room's
//! worker, which runs each one to completion (validate, persist, broadcast)
//! before taking the next. Rooms never wait on each other. A worker is retired
//! once its room has no members and is spawned again by the next update. A
//! respawned worker holds its commands until the retired one has drained, so
//! a room never has two workers applying updates at once.

use crate::broadcaster::RoomBroadcaster;
use crate::room_registry::ConnectionId;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// An update for a single room, tagged with the connection that sent it
#[derive(Debug, Clone, PartialEq)]
pub enum RoomCommand {
    Progress {
        origin: ConnectionId,
        progress: Vec<u32>,
    },
    PlayerProgress {
        origin: ConnectionId,
        player: u8,
        progress: Vec<u32>,
    },
    Mode {
        origin: ConnectionId,
        two_player_mode: bool,
    },
}

struct WorkerHandle {
    commands: mpsc::UnboundedSender<RoomCommand>,
    task: JoinHandle<()>,
}

pub struct RoomWorkers {
    broadcaster: Arc<RoomBroadcaster>,
    workers: HashMap<String, WorkerHandle>,
    /// Retired workers that may still be draining their queue
    draining: HashMap<String, JoinHandle<()>>,
}

impl RoomWorkers {
    pub fn new(broadcaster: Arc<RoomBroadcaster>) -> Self {
        Self {
            broadcaster,
            workers: HashMap::new(),
            draining: HashMap::new(),
        }
    }

    /// Queues a command on the room's worker, starting one if needed.
    pub fn dispatch(&mut self, room_id: &str, command: RoomCommand) {
        let command = match self.workers.remove(room_id) {
            Some(worker) => match worker.commands.send(command) {
                Ok(()) => {
                    self.workers.insert(room_id.to_string(), worker);
                    return;
                }
                // Worker exited; start a fresh one with the same command
                Err(mpsc::error::SendError(command)) => {
                    self.draining.insert(room_id.to_string(), worker.task);
                    command
                }
            },
            None => command,
        };

        let worker = self.spawn(room_id);
        if worker.commands.send(command).is_err() {
            warn!("Room {}: worker refused its first command", room_id);
        }
        self.workers.insert(room_id.to_string(), worker);
    }

    fn spawn(&mut self, room_id: &str) -> WorkerHandle {
        self.draining.retain(|_, task| !task.is_finished());
        let predecessor = self.draining.remove(room_id);

        let (commands, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_room_worker(
            room_id.to_string(),
            predecessor,
            receiver,
            Arc::clone(&self.broadcaster),
        ));
        debug!("Room {}: worker started", room_id);
        WorkerHandle { commands, task }
    }

    /// Lets the room's worker finish what is queued, then exit.
    pub fn retire(&mut self, room_id: &str) -> bool {
        let Some(worker) = self.workers.remove(room_id) else {
            return false;
        };

        // Closing the queue ends the worker once it is empty
        drop(worker.commands);
        self.draining.insert(room_id.to_string(), worker.task);
        debug!("Room {}: worker retired", room_id);
        true
    }

    pub fn active(&self) -> usize {
        self.workers.len()
    }

    /// Closes every queue and waits for all workers, retired ones included, to drain.
    pub async fn shutdown(&mut self) {
        let workers: Vec<(String, WorkerHandle)> = self.workers.drain().collect();
        info!("Stopping {} room worker(s)", workers.len());

        let mut tasks: Vec<(String, JoinHandle<()>)> = self.draining.drain().collect();
        for (room_id, worker) in workers {
            drop(worker.commands);
            tasks.push((room_id, worker.task));
        }

        for (room_id, task) in tasks {
            if let Err(e) = task.await {
                warn!("Room {}: worker ended abnormally: {}", room_id, e);
            }
        }
    }
}

/// Applies a room's commands one at a time until its queue is closed. When
/// `predecessor` is the room's previous worker, nothing is applied until it
/// has finished.
pub async fn run_room_worker(
    room_id: String,
    predecessor: Option<JoinHandle<()>>,
    mut commands: mpsc::UnboundedReceiver<RoomCommand>,
    broadcaster: Arc<RoomBroadcaster>,
) {
    if let Some(predecessor) = predecessor {
        debug!("Room {}: waiting for retired worker to drain", room_id);
        if let Err(e) = predecessor.await {
            warn!("Room {}: retired worker ended abnormally: {}", room_id, e);
        }
    }

    let mut applied: u64 = 0;

    while let Some(command) = commands.recv().await {
        // Failures were already reported to the sender by the broadcaster
        let _ = match command {
            RoomCommand::Progress { origin, progress } => {
                broadcaster.update_progress(origin, &room_id, &progress).await
            }
            RoomCommand::PlayerProgress {
                origin,
                player,
                progress,
            } => {
                broadcaster
                    .update_player_progress(origin, &room_id, player, &progress)
                    .await
            }
            RoomCommand::Mode {
                origin,
                two_player_mode,
            } => {
                broadcaster
                    .update_mode(origin, &room_id, two_player_mode)
                    .await
            }
        };
        applied += 1;
    }

    debug!("Room {}: worker stopped after {} update(s)", room_id, applied);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room_registry::RoomRegistry;
    use crate::store::{JsonStore, RunStore, StoreError};
    use async_trait::async_trait;
    use shared::{Challenge, ChallengeId, Packet, PlayerSlot, Progress, RunRecord};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::sync::RwLock;

    const ROOM: &str = "run-1";

    async fn setup() -> (
        RoomWorkers,
        Arc<JsonStore>,
        Arc<RwLock<RoomRegistry>>,
        ConnectionId,
        mpsc::UnboundedReceiver<Packet>,
    ) {
        let store = Arc::new(JsonStore::in_memory());
        store.create_run(ROOM, (1..=25).collect()).await.unwrap();

        let registry = Arc::new(RwLock::new(RoomRegistry::new(8)));
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = {
            let mut registry = registry.write().await;
            let id = registry.add_connection(addr, tx).unwrap();
            registry.join(id, ROOM);
            id
        };

        let broadcaster = Arc::new(RoomBroadcaster::new(store.clone(), registry.clone()));
        (RoomWorkers::new(broadcaster), store, registry, listener, rx)
    }

    #[tokio::test]
    async fn test_room_updates_apply_in_arrival_order() {
        let (mut workers, store, _registry, _listener, mut rx) = setup().await;

        for index in 0..10u32 {
            workers.dispatch(
                ROOM,
                RoomCommand::PlayerProgress {
                    origin: 999,
                    player: 1,
                    progress: vec![index],
                },
            );
        }
        assert_eq!(workers.active(), 1);
        workers.shutdown().await;

        for index in 0..10i64 {
            let expected = Packet::PlayerProgressUpdated {
                player: PlayerSlot::One,
                progress: Progress::try_from_indices([index]).unwrap(),
            };
            assert_eq!(rx.try_recv().unwrap(), expected);
        }
        assert!(rx.try_recv().is_err());

        let run = store.get_run(ROOM).await.unwrap().unwrap();
        assert_eq!(run.player1_progress, Progress::try_from_indices([9]).unwrap());
    }

    #[tokio::test]
    async fn test_retired_room_respawns_on_next_update() {
        let (mut workers, store, _registry, _listener, mut rx) = setup().await;

        workers.dispatch(
            ROOM,
            RoomCommand::Mode {
                origin: 999,
                two_player_mode: true,
            },
        );
        assert!(workers.retire(ROOM));
        assert!(!workers.retire(ROOM));
        assert_eq!(workers.active(), 0);

        workers.dispatch(
            ROOM,
            RoomCommand::Progress {
                origin: 999,
                progress: vec![3],
            },
        );
        assert_eq!(workers.active(), 1);
        workers.shutdown().await;

        assert_eq!(
            rx.try_recv().unwrap(),
            Packet::ModeUpdated {
                two_player_mode: true
            }
        );
        assert!(matches!(rx.try_recv(), Ok(Packet::ProgressUpdated { .. })));

        let run = store.get_run(ROOM).await.unwrap().unwrap();
        assert!(run.two_player_mode);
        assert_eq!(run.progress, Progress::try_from_indices([3]).unwrap());
    }

    #[tokio::test]
    async fn test_rejected_update_does_not_stop_worker() {
        let (mut workers, store, registry, listener, mut rx) = setup().await;

        workers.dispatch(
            ROOM,
            RoomCommand::PlayerProgress {
                origin: listener,
                player: 7,
                progress: vec![1],
            },
        );
        workers.dispatch(
            ROOM,
            RoomCommand::PlayerProgress {
                origin: 999,
                player: 2,
                progress: vec![1],
            },
        );
        workers.shutdown().await;

        assert!(matches!(rx.try_recv(), Ok(Packet::Error { .. })));
        assert!(matches!(
            rx.try_recv(),
            Ok(Packet::PlayerProgressUpdated {
                player: PlayerSlot::Two,
                ..
            })
        ));

        let run = store.get_run(ROOM).await.unwrap().unwrap();
        assert_eq!(run.player2_progress.len(), 1);
        assert_eq!(registry.read().await.members(ROOM), vec![listener]);
    }

    /// Store whose player writes stall when they mark cell 0
    struct StallOnFirstCell {
        inner: JsonStore,
    }

    #[async_trait]
    impl RunStore for StallOnFirstCell {
        async fn list_challenges(&self) -> Result<Vec<Challenge>, StoreError> {
            self.inner.list_challenges().await
        }

        async fn get_challenge(&self, id: ChallengeId) -> Result<Option<Challenge>, StoreError> {
            self.inner.get_challenge(id).await
        }

        async fn add_challenge(&self, title: &str, description: &str) -> Result<Challenge, StoreError> {
            self.inner.add_challenge(title, description).await
        }

        async fn delete_challenge(&self, id: ChallengeId) -> Result<bool, StoreError> {
            self.inner.delete_challenge(id).await
        }

        async fn create_run(&self, id: &str, challenges: Vec<ChallengeId>) -> Result<RunRecord, StoreError> {
            self.inner.create_run(id, challenges).await
        }

        async fn get_run(&self, id: &str) -> Result<Option<RunRecord>, StoreError> {
            self.inner.get_run(id).await
        }

        async fn update_progress(&self, id: &str, progress: Progress) -> Result<(), StoreError> {
            self.inner.update_progress(id, progress).await
        }

        async fn update_player_progress(
            &self,
            id: &str,
            player: PlayerSlot,
            progress: Progress,
        ) -> Result<(), StoreError> {
            if progress.contains(0) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.inner.update_player_progress(id, player, progress).await
        }

        async fn update_mode(&self, id: &str, two_player_mode: bool) -> Result<(), StoreError> {
            self.inner.update_mode(id, two_player_mode).await
        }
    }

    #[tokio::test]
    async fn test_respawned_worker_waits_for_retired_one() {
        let store = Arc::new(StallOnFirstCell {
            inner: JsonStore::in_memory(),
        });
        store.create_run(ROOM, (1..=25).collect()).await.unwrap();
        let registry = Arc::new(RwLock::new(RoomRegistry::new(8)));
        let broadcaster = Arc::new(RoomBroadcaster::new(store.clone(), registry));
        let mut workers = RoomWorkers::new(broadcaster);

        workers.dispatch(
            ROOM,
            RoomCommand::PlayerProgress {
                origin: 999,
                player: 1,
                progress: vec![0],
            },
        );
        assert!(workers.retire(ROOM));

        // Arrives while the stalled write is still in flight
        workers.dispatch(
            ROOM,
            RoomCommand::PlayerProgress {
                origin: 999,
                player: 1,
                progress: vec![1],
            },
        );
        workers.shutdown().await;

        let run = store.get_run(ROOM).await.unwrap().unwrap();
        assert_eq!(run.player1_progress, Progress::try_from_indices([1]).unwrap());
    }

    #[tokio::test]
    async fn test_updates_to_empty_room_stay_ordered() {
        let store = Arc::new(StallOnFirstCell {
            inner: JsonStore::in_memory(),
        });
        store.create_run(ROOM, (1..=25).collect()).await.unwrap();
        let registry = Arc::new(RwLock::new(RoomRegistry::new(8)));
        let broadcaster = Arc::new(RoomBroadcaster::new(store.clone(), registry));
        let mut workers = RoomWorkers::new(broadcaster);

        // Nobody is in the room, so every update is followed by a retire
        for progress in [vec![0], vec![0, 3], vec![4]] {
            workers.dispatch(
                ROOM,
                RoomCommand::PlayerProgress {
                    origin: 999,
                    player: 2,
                    progress,
                },
            );
            workers.retire(ROOM);
        }
        assert_eq!(workers.active(), 0);
        workers.shutdown().await;

        let run = store.get_run(ROOM).await.unwrap().unwrap();
        assert_eq!(run.player2_progress, Progress::try_from_indices([4]).unwrap());
    }
}
