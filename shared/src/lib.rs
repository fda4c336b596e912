use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod board;

pub const BOARD_SIZE: usize = 25;
pub const BOARD_WIDTH: usize = 5;
pub const MAX_FRAME_LEN: usize = 64 * 1024;

pub type ChallengeId = u64;

/// Rejections raised before a request is allowed anywhere near persistence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Player must be 1 or 2")]
    Player,
    #[error("Progress must be an array")]
    ProgressNotArray,
    #[error("Progress entries must be integer cell indices")]
    IndexNotInteger,
    #[error("Progress index {0} is outside the 25-cell board")]
    IndexOutOfRange(i64),
    #[error("twoPlayerMode must be a boolean")]
    ModeNotBoolean,
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    JoinRoom {
        room_id: String,
    },
    LeaveRoom {
        room_id: String,
    },
    UpdateProgress {
        room_id: String,
        progress: Vec<u32>,
    },
    UpdatePlayerProgress {
        room_id: String,
        player: u8,
        progress: Vec<u32>,
    },
    UpdateMode {
        room_id: String,
        two_player_mode: bool,
    },

    RoomJoined {
        room_id: String,
    },
    RoomLeft {
        room_id: String,
    },
    ProgressUpdated {
        progress: Progress,
    },
    PlayerProgressUpdated {
        player: PlayerSlot,
        progress: Progress,
    },
    ModeUpdated {
        two_player_mode: bool,
    },
    Error {
        message: String,
    },
}

/// One of the two seats on a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PlayerSlot {
    One,
    Two,
}

impl PlayerSlot {
    pub fn from_number(number: i64) -> Result<Self, ValidationError> {
        match number {
            1 => Ok(PlayerSlot::One),
            2 => Ok(PlayerSlot::Two),
            _ => Err(ValidationError::Player),
        }
    }

    pub fn number(self) -> u8 {
        match self {
            PlayerSlot::One => 1,
            PlayerSlot::Two => 2,
        }
    }
}

impl TryFrom<u8> for PlayerSlot {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        PlayerSlot::from_number(i64::from(value))
    }
}

impl From<PlayerSlot> for u8 {
    fn from(slot: PlayerSlot) -> Self {
        slot.number()
    }
}

/// Set of completed cell indices, always within `0..BOARD_SIZE`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Progress(BTreeSet<u8>);

impl Progress {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Builds a progress set from untrusted indices. Duplicates collapse.
    pub fn try_from_indices<I>(indices: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = i64>,
    {
        let mut cells = BTreeSet::new();
        for index in indices {
            if index < 0 || index >= BOARD_SIZE as i64 {
                return Err(ValidationError::IndexOutOfRange(index));
            }
            cells.insert(index as u8);
        }
        Ok(Self(cells))
    }

    pub fn from_wire(indices: &[u32]) -> Result<Self, ValidationError> {
        Self::try_from_indices(indices.iter().map(|&index| i64::from(index)))
    }

    pub fn contains(&self, index: u8) -> bool {
        self.0.contains(&index)
    }

    /// Returns the set with `index` flipped: added when absent, removed when present.
    pub fn toggled(&self, index: u8) -> Self {
        let mut cells = self.0.clone();
        if !cells.remove(&index) {
            cells.insert(index);
        }
        Self(cells)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().copied()
    }

    pub fn to_wire(&self) -> Vec<u32> {
        self.0.iter().map(|&index| u32::from(index)).collect()
    }

    pub fn union_len(&self, other: &Progress) -> usize {
        self.0.union(&other.0).count()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub id: ChallengeId,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Challenge {
    /// Only complete entries take part in board generation.
    pub fn is_valid(&self) -> bool {
        self.id != 0 && !self.title.is_empty() && !self.description.is_empty()
    }
}

/// Persisted state of one generated board.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub challenges: Vec<ChallengeId>,
    pub progress: Progress,
    pub two_player_mode: bool,
    pub player1_progress: Progress,
    pub player2_progress: Progress,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(id: String, challenges: Vec<ChallengeId>) -> Self {
        Self {
            id,
            challenges,
            progress: Progress::new(),
            two_player_mode: false,
            player1_progress: Progress::new(),
            player2_progress: Progress::new(),
            created_at: Utc::now(),
        }
    }

    pub fn player_progress(&self, player: PlayerSlot) -> &Progress {
        match player {
            PlayerSlot::One => &self.player1_progress,
            PlayerSlot::Two => &self.player2_progress,
        }
    }

    pub fn set_player_progress(&mut self, player: PlayerSlot, progress: Progress) {
        match player {
            PlayerSlot::One => self.player1_progress = progress,
            PlayerSlot::Two => self.player2_progress = progress,
        }
    }
}

/// A run with its challenge ids resolved. Challenges deleted after the
/// run was created resolve to `None`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RunView {
    pub id: String,
    pub challenges: Vec<Option<Challenge>>,
    pub progress: Progress,
    pub two_player_mode: bool,
    pub player1_progress: Progress,
    pub player2_progress: Progress,
    pub created_at: DateTime<Utc>,
}

impl RunView {
    pub fn player_progress(&self, player: PlayerSlot) -> &Progress {
        match player {
            PlayerSlot::One => &self.player1_progress,
            PlayerSlot::Two => &self.player2_progress,
        }
    }
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    let body = bincode::serialize(packet)?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_packet(body: &[u8]) -> Result<Packet, bincode::Error> {
    bincode::deserialize(body)
}

/// Reads one length-prefixed frame body. `Ok(None)` means the peer closed
/// the stream cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_LEN),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame =
        encode_packet(packet).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_slot_validation() {
        assert_eq!(PlayerSlot::from_number(1), Ok(PlayerSlot::One));
        assert_eq!(PlayerSlot::from_number(2), Ok(PlayerSlot::Two));
        assert_eq!(PlayerSlot::from_number(0), Err(ValidationError::Player));
        assert_eq!(PlayerSlot::from_number(3), Err(ValidationError::Player));
        assert_eq!(PlayerSlot::from_number(-1), Err(ValidationError::Player));
    }

    #[test]
    fn test_player_slot_rejects_unknown_seat_on_the_wire() {
        let bytes = bincode::serialize(&3u8).unwrap();
        let decoded: Result<PlayerSlot, _> = bincode::deserialize(&bytes);
        assert!(decoded.is_err());

        let bytes = bincode::serialize(&2u8).unwrap();
        let decoded: PlayerSlot = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, PlayerSlot::Two);
    }

    #[test]
    fn test_progress_from_indices_collapses_duplicates() {
        let progress = Progress::try_from_indices(vec![5, 2, 5, 24, 0]).unwrap();
        assert_eq!(progress.len(), 4);
        assert_eq!(progress.iter().collect::<Vec<_>>(), vec![0, 2, 5, 24]);
    }

    #[test]
    fn test_progress_rejects_out_of_range_index() {
        assert_eq!(
            Progress::try_from_indices(vec![1, 25]),
            Err(ValidationError::IndexOutOfRange(25))
        );
        assert_eq!(
            Progress::try_from_indices(vec![-1]),
            Err(ValidationError::IndexOutOfRange(-1))
        );
        assert_eq!(
            Progress::from_wire(&[3, 300]),
            Err(ValidationError::IndexOutOfRange(300))
        );
    }

    #[test]
    fn test_progress_toggle_twice_restores_original() {
        let original = Progress::try_from_indices(vec![1, 7]).unwrap();

        let once = original.toggled(12);
        assert!(once.contains(12));
        assert_eq!(once.len(), 3);

        let twice = once.toggled(12);
        assert_eq!(twice, original);

        let removed = original.toggled(7);
        assert!(!removed.contains(7));
        assert_eq!(removed.toggled(7), original);
    }

    #[test]
    fn test_progress_serializes_as_sorted_sequence() {
        let progress = Progress::try_from_indices(vec![9, 3]).unwrap();
        assert_eq!(progress.to_wire(), vec![3, 9]);

        let bytes = bincode::serialize(&progress).unwrap();
        let decoded: Progress = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, progress);
    }

    #[test]
    fn test_progress_union_len() {
        let p1 = Progress::try_from_indices(vec![0, 1, 2]).unwrap();
        let p2 = Progress::try_from_indices(vec![2, 3]).unwrap();
        assert_eq!(p1.union_len(&p2), 4);
        assert_eq!(Progress::new().union_len(&Progress::new()), 0);
    }

    #[test]
    fn test_challenge_validity() {
        let mut challenge = Challenge {
            id: 4,
            title: "Speedrun".to_string(),
            description: "Finish under an hour".to_string(),
            created_at: Utc::now(),
        };
        assert!(challenge.is_valid());

        challenge.title.clear();
        assert!(!challenge.is_valid());

        challenge.title = "Speedrun".to_string();
        challenge.id = 0;
        assert!(!challenge.is_valid());
    }

    #[test]
    fn test_run_record_player_progress() {
        let mut run = RunRecord::new("run".to_string(), (1..=25).collect());
        assert!(run.player_progress(PlayerSlot::One).is_empty());
        assert!(!run.two_player_mode);

        let progress = Progress::try_from_indices(vec![2, 5]).unwrap();
        run.set_player_progress(PlayerSlot::Two, progress.clone());

        assert_eq!(run.player_progress(PlayerSlot::Two), &progress);
        assert!(run.player_progress(PlayerSlot::One).is_empty());
    }

    #[tokio::test]
    async fn test_packet_framing_over_stream() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);

        let packet = Packet::UpdatePlayerProgress {
            room_id: "room".to_string(),
            player: 1,
            progress: vec![2, 5],
        };
        write_packet(&mut writer, &packet).await.unwrap();
        drop(writer);

        let body = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(decode_packet(&body).unwrap(), packet);

        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let result = read_frame(&mut reader).await;
        tokio_test::assert_err!(result);
    }

    #[test]
    fn test_malformed_bool_is_not_a_packet() {
        let packet = Packet::UpdateMode {
            room_id: "r".to_string(),
            two_player_mode: true,
        };
        let frame = encode_packet(&packet).unwrap();
        let mut body = frame[4..].to_vec();
        let last = body.len() - 1;
        body[last] = 2;

        assert!(decode_packet(&body).is_err());
    }
}
