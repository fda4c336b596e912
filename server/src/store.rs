//! Persistence for challenges and runs
//!
//! The rest of the server only talks to the [`RunStore`] trait, handed in as
//! an `Arc<dyn RunStore>`. Each call reads or writes one record atomically;
//! there is no compare-and-swap, so two writers racing on the same run simply
//! leave whichever value landed last.
//!
//! [`JsonStore`] keeps everything in memory and, when opened with a path,
//! rewrites a JSON snapshot on every mutation before acknowledging it.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::{Challenge, ChallengeId, PlayerSlot, Progress, RunRecord};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("run {0} already exists")]
    DuplicateRun(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("store encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// All challenges, newest first.
    async fn list_challenges(&self) -> Result<Vec<Challenge>, StoreError>;

    async fn get_challenge(&self, id: ChallengeId) -> Result<Option<Challenge>, StoreError>;

    async fn add_challenge(&self, title: &str, description: &str)
        -> Result<Challenge, StoreError>;

    /// Returns whether a challenge was removed.
    async fn delete_challenge(&self, id: ChallengeId) -> Result<bool, StoreError>;

    async fn create_run(
        &self,
        id: &str,
        challenges: Vec<ChallengeId>,
    ) -> Result<RunRecord, StoreError>;

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>, StoreError>;

    async fn update_progress(&self, id: &str, progress: Progress) -> Result<(), StoreError>;

    /// Replaces the whole progress set of one player.
    async fn update_player_progress(
        &self,
        id: &str,
        player: PlayerSlot,
        progress: Progress,
    ) -> Result<(), StoreError>;

    async fn update_mode(&self, id: &str, two_player_mode: bool) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    last_challenge_id: ChallengeId,
    challenges: Vec<Challenge>,
    runs: HashMap<String, RunRecord>,
}

impl Snapshot {
    fn run_mut(&mut self, id: &str) -> Result<&mut RunRecord, StoreError> {
        self.runs
            .get_mut(id)
            .ok_or_else(|| StoreError::RunNotFound(id.to_string()))
    }
}

pub struct JsonStore {
    state: RwLock<Snapshot>,
    path: Option<PathBuf>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(Snapshot::default()),
            path: None,
        }
    }

    /// Opens the snapshot at `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            "Opened store {} ({} challenges, {} runs)",
            path.display(),
            snapshot.challenges.len(),
            snapshot.runs.len()
        );

        Ok(Self {
            state: RwLock::new(snapshot),
            path: Some(path),
        })
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_vec_pretty(snapshot)?;
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, path).await?;
        debug!("Persisted store snapshot to {}", path.display());
        Ok(())
    }

    /// Writes the already-changed snapshot out. When that fails, `rollback`
    /// undoes the change so memory never runs ahead of the file.
    async fn commit<T, R>(
        &self,
        snapshot: &mut Snapshot,
        value: T,
        rollback: R,
    ) -> Result<T, StoreError>
    where
        T: Send,
        R: FnOnce(&mut Snapshot) + Send,
    {
        match self.persist(snapshot).await {
            Ok(()) => Ok(value),
            Err(e) => {
                rollback(snapshot);
                Err(e)
            }
        }
    }

    /// Changes one run in place, keeping only that record aside for rollback.
    async fn update_run<F>(&self, id: &str, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut RunRecord) + Send,
    {
        let mut state = self.state.write().await;
        let run = state.run_mut(id)?;
        let previous = run.clone();
        change(run);

        let id = id.to_string();
        self.commit(&mut state, (), move |snapshot| {
            snapshot.runs.insert(id, previous);
        })
        .await
    }
}

#[async_trait]
impl RunStore for JsonStore {
    async fn list_challenges(&self) -> Result<Vec<Challenge>, StoreError> {
        let state = self.state.read().await;
        let mut challenges = state.challenges.clone();
        challenges.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(challenges)
    }

    async fn get_challenge(&self, id: ChallengeId) -> Result<Option<Challenge>, StoreError> {
        let state = self.state.read().await;
        Ok(state.challenges.iter().find(|c| c.id == id).cloned())
    }

    async fn add_challenge(
        &self,
        title: &str,
        description: &str,
    ) -> Result<Challenge, StoreError> {
        let mut state = self.state.write().await;
        let previous_id = state.last_challenge_id;
        state.last_challenge_id += 1;
        let challenge = Challenge {
            id: state.last_challenge_id,
            title: title.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
        };
        state.challenges.push(challenge.clone());

        self.commit(&mut state, challenge, move |snapshot| {
            snapshot.challenges.pop();
            snapshot.last_challenge_id = previous_id;
        })
        .await
    }

    async fn delete_challenge(&self, id: ChallengeId) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let Some(position) = state.challenges.iter().position(|c| c.id == id) else {
            return Ok(false);
        };
        let removed = state.challenges.remove(position);

        self.commit(&mut state, true, move |snapshot| {
            snapshot.challenges.insert(position, removed);
        })
        .await
    }

    async fn create_run(
        &self,
        id: &str,
        challenges: Vec<ChallengeId>,
    ) -> Result<RunRecord, StoreError> {
        let mut state = self.state.write().await;
        if state.runs.contains_key(id) {
            return Err(StoreError::DuplicateRun(id.to_string()));
        }
        let run = RunRecord::new(id.to_string(), challenges);
        state.runs.insert(id.to_string(), run.clone());

        let id = id.to_string();
        self.commit(&mut state, run, move |snapshot| {
            snapshot.runs.remove(&id);
        })
        .await
    }

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state.runs.get(id).cloned())
    }

    async fn update_progress(&self, id: &str, progress: Progress) -> Result<(), StoreError> {
        self.update_run(id, move |run| run.progress = progress).await
    }

    async fn update_player_progress(
        &self,
        id: &str,
        player: PlayerSlot,
        progress: Progress,
    ) -> Result<(), StoreError> {
        self.update_run(id, move |run| run.set_player_progress(player, progress))
            .await
    }

    async fn update_mode(&self, id: &str, two_player_mode: bool) -> Result<(), StoreError> {
        self.update_run(id, move |run| run.two_player_mode = two_player_mode)
            .await
    }
}
