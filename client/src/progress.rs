//! Optimistic progress handling
//!
//! A toggle is shown immediately, persisted in the background and confirmed
//! or reverted once the store answers. Each toggle captures the value it
//! replaced; a failed toggle puts exactly that value back, even when another
//! toggle for the same player has succeeded in the meantime. Toggles are not
//! queued, so two quick clicks race each other against the store.
//!
//! Broadcasts from other participants simply replace the cached value.

use crate::error::ClientError;
use async_trait::async_trait;
use log::{debug, warn};
use shared::{PlayerSlot, Progress, RunView, ValidationError, BOARD_SIZE};
use tokio::sync::Mutex;

/// A toggle that has been applied locally but not yet settled
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToggle {
    pub player: PlayerSlot,
    pub index: u8,
    /// Value before the toggle, restored on failure
    pub previous: Progress,
    /// Value shown while the toggle is in flight
    pub next: Progress,
}

/// Client-side view of a run's mutable state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressReconciler {
    player1: Progress,
    player2: Progress,
    board: Progress,
    two_player_mode: bool,
}

impl ProgressReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the cache from the last value read from the server.
    pub fn from_run(run: &RunView) -> Self {
        Self {
            player1: run.player1_progress.clone(),
            player2: run.player2_progress.clone(),
            board: run.progress.clone(),
            two_player_mode: run.two_player_mode,
        }
    }

    pub fn player_progress(&self, player: PlayerSlot) -> &Progress {
        match player {
            PlayerSlot::One => &self.player1,
            PlayerSlot::Two => &self.player2,
        }
    }

    fn player_progress_mut(&mut self, player: PlayerSlot) -> &mut Progress {
        match player {
            PlayerSlot::One => &mut self.player1,
            PlayerSlot::Two => &mut self.player2,
        }
    }

    pub fn board_progress(&self) -> &Progress {
        &self.board
    }

    pub fn two_player_mode(&self) -> bool {
        self.two_player_mode
    }

    /// Flips `index` for `player` locally and returns what is needed to
    /// settle it later.
    pub fn begin_toggle(
        &mut self,
        player: PlayerSlot,
        index: u8,
    ) -> Result<PendingToggle, ValidationError> {
        if usize::from(index) >= BOARD_SIZE {
            return Err(ValidationError::IndexOutOfRange(i64::from(index)));
        }

        let slot = self.player_progress_mut(player);
        let previous = slot.clone();
        let next = previous.toggled(index);
        *slot = next.clone();

        debug!(
            "Player {} cell {} toggled locally ({} -> {} completed)",
            player.number(),
            index,
            previous.len(),
            next.len()
        );
        Ok(PendingToggle {
            player,
            index,
            previous,
            next,
        })
    }

    /// Keeps the optimistic value on success, restores the captured one on
    /// failure. Returns true when the toggle was reverted.
    pub fn settle(&mut self, pending: &PendingToggle, confirmed: bool) -> bool {
        if confirmed {
            return false;
        }

        debug!(
            "Reverting player {} cell {}",
            pending.player.number(),
            pending.index
        );
        *self.player_progress_mut(pending.player) = pending.previous.clone();
        true
    }

    pub fn apply_remote(&mut self, player: PlayerSlot, progress: Progress) {
        *self.player_progress_mut(player) = progress;
    }

    pub fn apply_board_progress(&mut self, progress: Progress) {
        self.board = progress;
    }

    pub fn apply_mode(&mut self, two_player_mode: bool) {
        self.two_player_mode = two_player_mode;
    }
}

/// Where toggles are persisted and announced
#[async_trait]
pub trait ProgressBackend: Send + Sync {
    /// Writes the whole progress set for a player.
    async fn persist_player_progress(
        &self,
        run_id: &str,
        player: PlayerSlot,
        progress: &Progress,
    ) -> Result<(), ClientError>;

    /// Tells the other participants in the room about a persisted value.
    async fn announce_player_progress(
        &self,
        run_id: &str,
        player: PlayerSlot,
        progress: &Progress,
    ) -> Result<(), ClientError>;
}

/// Applies a toggle optimistically, persists it, then announces or reverts.
///
/// Returns the value the cache holds for the player afterwards.
pub async fn sync_toggle(
    reconciler: &Mutex<ProgressReconciler>,
    backend: &dyn ProgressBackend,
    run_id: &str,
    player: PlayerSlot,
    index: u8,
) -> Result<Progress, ClientError> {
    let pending = reconciler.lock().await.begin_toggle(player, index)?;

    if let Err(e) = backend
        .persist_player_progress(run_id, player, &pending.next)
        .await
    {
        warn!(
            "Failed to save player {} cell {}: {}",
            player.number(),
            index,
            e
        );
        reconciler.lock().await.settle(&pending, false);
        return Err(e);
    }

    reconciler.lock().await.settle(&pending, true);

    // Already persisted, so a failed announcement only delays the others
    if let Err(e) = backend
        .announce_player_progress(run_id, player, &pending.next)
        .await
    {
        warn!("Saved but could not announce update: {}", e);
    }

    Ok(pending.next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn progress(indices: &[i64]) -> Progress {
        Progress::try_from_indices(indices.iter().copied()).unwrap()
    }

    /// Backend double that fails or delays writes of specific payloads
    #[derive(Default)]
    struct ScriptedBackend {
        failing: Vec<Progress>,
        delays: Vec<(Progress, Duration)>,
        persisted: StdMutex<Vec<Progress>>,
        announced: StdMutex<Vec<Progress>>,
    }

    #[async_trait]
    impl ProgressBackend for ScriptedBackend {
        async fn persist_player_progress(
            &self,
            _run_id: &str,
            _player: PlayerSlot,
            progress: &Progress,
        ) -> Result<(), ClientError> {
            let delay = self
                .delays
                .iter()
                .find(|(payload, _)| payload == progress)
                .map(|(_, delay)| *delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.contains(progress) {
                return Err(ClientError::Rejected {
                    status: 500,
                    message: "Failed to update player progress".to_string(),
                });
            }
            self.persisted.lock().unwrap().push(progress.clone());
            Ok(())
        }

        async fn announce_player_progress(
            &self,
            _run_id: &str,
            _player: PlayerSlot,
            progress: &Progress,
        ) -> Result<(), ClientError> {
            self.announced.lock().unwrap().push(progress.clone());
            Ok(())
        }
    }

    #[test]
    fn test_toggle_twice_restores_original() {
        let mut reconciler = ProgressReconciler::new();
        reconciler.apply_remote(PlayerSlot::One, progress(&[3, 8]));

        let first = reconciler.begin_toggle(PlayerSlot::One, 12).unwrap();
        assert_eq!(first.next, progress(&[3, 8, 12]));
        reconciler.settle(&first, true);

        let second = reconciler.begin_toggle(PlayerSlot::One, 12).unwrap();
        reconciler.settle(&second, true);

        assert_eq!(reconciler.player_progress(PlayerSlot::One), &progress(&[3, 8]));
        assert!(reconciler.player_progress(PlayerSlot::Two).is_empty());
    }

    #[test]
    fn test_failed_toggle_reverts() {
        let mut reconciler = ProgressReconciler::new();
        reconciler.apply_remote(PlayerSlot::Two, progress(&[4]));

        let pending = reconciler.begin_toggle(PlayerSlot::Two, 4).unwrap();
        assert!(reconciler.player_progress(PlayerSlot::Two).is_empty());

        assert!(reconciler.settle(&pending, false));
        assert_eq!(reconciler.player_progress(PlayerSlot::Two), &progress(&[4]));
    }

    #[test]
    fn test_out_of_range_toggle_rejected() {
        let mut reconciler = ProgressReconciler::new();
        let result = reconciler.begin_toggle(PlayerSlot::One, 25);
        assert_eq!(result, Err(ValidationError::IndexOutOfRange(25)));
        assert!(reconciler.player_progress(PlayerSlot::One).is_empty());
    }

    #[test]
    fn test_remote_updates_replace_cache() {
        let mut reconciler = ProgressReconciler::new();
        reconciler.apply_remote(PlayerSlot::One, progress(&[1, 2, 3]));
        reconciler.apply_remote(PlayerSlot::One, progress(&[9]));
        reconciler.apply_mode(true);
        reconciler.apply_board_progress(progress(&[0]));

        assert_eq!(reconciler.player_progress(PlayerSlot::One), &progress(&[9]));
        assert!(reconciler.two_player_mode());
        assert_eq!(reconciler.board_progress(), &progress(&[0]));
    }

    #[test]
    fn test_late_failure_restores_its_own_snapshot() {
        let mut reconciler = ProgressReconciler::new();

        let a = reconciler.begin_toggle(PlayerSlot::One, 1).unwrap();
        let b = reconciler.begin_toggle(PlayerSlot::One, 2).unwrap();
        assert_eq!(b.previous, progress(&[1]));

        reconciler.settle(&b, true);
        reconciler.settle(&a, false);

        // The value from before `a` comes back, dropping `b` as well
        assert!(reconciler.player_progress(PlayerSlot::One).is_empty());
    }

    #[tokio::test]
    async fn test_sync_toggle_persists_then_announces() {
        let reconciler = Mutex::new(ProgressReconciler::new());
        let backend = ScriptedBackend::default();

        let result = sync_toggle(&reconciler, &backend, "run-1", PlayerSlot::One, 7).await;

        assert_eq!(result.unwrap(), progress(&[7]));
        assert_eq!(*backend.persisted.lock().unwrap(), vec![progress(&[7])]);
        assert_eq!(*backend.announced.lock().unwrap(), vec![progress(&[7])]);
        assert_eq!(
            reconciler.lock().await.player_progress(PlayerSlot::One),
            &progress(&[7])
        );
    }

    #[tokio::test]
    async fn test_sync_toggle_failure_reverts_without_announcing() {
        let reconciler = Mutex::new(ProgressReconciler::new());
        let backend = ScriptedBackend {
            failing: vec![progress(&[7])],
            ..Default::default()
        };

        let result = sync_toggle(&reconciler, &backend, "run-1", PlayerSlot::One, 7).await;

        assert!(matches!(result, Err(ClientError::Rejected { status: 500, .. })));
        assert!(backend.announced.lock().unwrap().is_empty());
        assert!(reconciler
            .lock()
            .await
            .player_progress(PlayerSlot::One)
            .is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_toggles_race_independently() {
        let reconciler = Mutex::new(ProgressReconciler::new());
        let backend = ScriptedBackend {
            failing: vec![progress(&[1])],
            delays: vec![(progress(&[1]), Duration::from_millis(30))],
            ..Default::default()
        };

        let (slow_fail, fast_ok) = tokio::join!(
            sync_toggle(&reconciler, &backend, "run-1", PlayerSlot::One, 1),
            sync_toggle(&reconciler, &backend, "run-1", PlayerSlot::One, 2),
        );

        tokio_test::assert_err!(slow_fail);
        assert_eq!(fast_ok.unwrap(), progress(&[1, 2]));

        // The slow failure restores the empty set it captured
        assert!(reconciler
            .lock()
            .await
            .player_progress(PlayerSlot::One)
            .is_empty());
        assert_eq!(*backend.announced.lock().unwrap(), vec![progress(&[1, 2])]);
    }
}
