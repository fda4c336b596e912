//! Run creation and lookup on top of a [`RunStore`]

use crate::error::SyncError;
use crate::store::RunStore;
use log::info;
use shared::board::generate_board;
use shared::{Challenge, ChallengeId, RunRecord, RunView};
use uuid::Uuid;

/// Creates a run under a fresh random id.
pub async fn create_run(store: &dyn RunStore) -> Result<RunView, SyncError> {
    create_run_with_id(store, &Uuid::new_v4().to_string()).await
}

/// Creates a run whose board is seeded by `run_id`.
///
/// The pool is the current challenge list in its listing order, so the same
/// id and catalogue always yield the same board.
pub async fn create_run_with_id(store: &dyn RunStore, run_id: &str) -> Result<RunView, SyncError> {
    let pool = store.list_challenges().await?;
    let board = generate_board(run_id, &pool)?;
    let ids: Vec<ChallengeId> = board.iter().map(|challenge| challenge.id).collect();

    let record = store.create_run(run_id, ids).await?;
    info!("Created run {} from a pool of {} challenge(s)", record.id, pool.len());

    Ok(view(record, board.into_iter().map(Some).collect()))
}

/// Loads a run and resolves its challenge ids. Challenges deleted since the
/// run was created come back as `None`, keeping cell positions stable.
pub async fn resolve_run(store: &dyn RunStore, run_id: &str) -> Result<RunView, SyncError> {
    let record = store
        .get_run(run_id)
        .await?
        .ok_or_else(|| SyncError::NotFound("Bingo run not found".to_string()))?;

    let mut challenges = Vec::with_capacity(record.challenges.len());
    for id in &record.challenges {
        challenges.push(store.get_challenge(*id).await?);
    }

    Ok(view(record, challenges))
}

fn view(record: RunRecord, challenges: Vec<Option<Challenge>>) -> RunView {
    RunView {
        id: record.id,
        challenges,
        progress: record.progress,
        two_player_mode: record.two_player_mode,
        player1_progress: record.player1_progress,
        player2_progress: record.player2_progress,
        created_at: record.created_at,
    }
}
