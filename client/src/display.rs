//! Text rendering of a board and its completion summary

use shared::{Challenge, Progress, BOARD_SIZE, BOARD_WIDTH};
use std::fmt::Write;

const CELL_WIDTH: usize = 22;

/// Completion counts shown above the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardSummary {
    pub player1: usize,
    pub player2: usize,
    /// Cells completed by at least one player
    pub total: usize,
    pub percent: u32,
}

impl BoardSummary {
    pub fn new(player1: &Progress, player2: &Progress) -> Self {
        let total = player1.union_len(player2);
        let percent = (total as f64 / BOARD_SIZE as f64 * 100.0).round() as u32;
        Self {
            player1: player1.len(),
            player2: player2.len(),
            total,
            percent,
        }
    }
}

impl std::fmt::Display for BoardSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Player 1: {}/{} | Player 2: {}/{} | Total: {}/{} ({}%)",
            self.player1,
            BOARD_SIZE,
            self.player2,
            BOARD_SIZE,
            self.total,
            BOARD_SIZE,
            self.percent
        )
    }
}

fn cell_label(index: usize, challenge: Option<&Challenge>, player1: bool, player2: bool) -> String {
    let marks = match (player1, player2) {
        (true, true) => "12",
        (true, false) => "1 ",
        (false, true) => " 2",
        (false, false) => "  ",
    };
    let title = challenge.map_or("(removed)", |c| c.title.as_str());
    let label = format!("{:>2}[{}] {}", index, marks, title);
    label.chars().take(CELL_WIDTH).collect()
}

/// Renders the 5×5 grid with each cell's index, player marks and title.
pub fn render_board(
    challenges: &[Option<Challenge>],
    player1: &Progress,
    player2: &Progress,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", BoardSummary::new(player1, player2));

    let divider = format!("+{}", format!("{}+", "-".repeat(CELL_WIDTH + 2)).repeat(BOARD_WIDTH));
    let _ = writeln!(out, "{}", divider);

    for (row_number, row) in challenges.chunks(BOARD_WIDTH).enumerate() {
        out.push('|');
        for (column, challenge) in row.iter().enumerate() {
            let index = row_number * BOARD_WIDTH + column;
            let cell = u8::try_from(index).unwrap_or(u8::MAX);
            let label = cell_label(
                index,
                challenge.as_ref(),
                player1.contains(cell),
                player2.contains(cell),
            );
            let _ = write!(out, " {:<width$} |", label, width = CELL_WIDTH);
        }
        out.push('\n');
        let _ = writeln!(out, "{}", divider);
    }
    out
}
