use crate::display::render_board;
use crate::error::ClientError;
use crate::http::HttpApi;
use crate::progress::{sync_toggle, ProgressBackend, ProgressReconciler};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use shared::{decode_packet, read_frame, write_packet, Challenge, Packet, PlayerSlot, Progress, RunView};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// How long `leave_confirmed` waits for the server before giving up
const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Persists over HTTP and announces over the real-time channel
pub struct LiveBackend {
    http: HttpApi,
    outbound: mpsc::UnboundedSender<Packet>,
}

impl LiveBackend {
    fn send(&self, packet: Packet) -> Result<(), ClientError> {
        self.outbound
            .send(packet)
            .map_err(|_| ClientError::ChannelClosed)
    }
}

#[async_trait]
impl ProgressBackend for LiveBackend {
    async fn persist_player_progress(
        &self,
        run_id: &str,
        player: PlayerSlot,
        progress: &Progress,
    ) -> Result<(), ClientError> {
        self.http
            .update_player_progress(run_id, player, progress)
            .await
    }

    async fn announce_player_progress(
        &self,
        run_id: &str,
        player: PlayerSlot,
        progress: &Progress,
    ) -> Result<(), ClientError> {
        self.send(Packet::UpdatePlayerProgress {
            room_id: run_id.to_string(),
            player: player.number(),
            progress: progress.to_wire(),
        })
    }
}

/// A line typed at the prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Toggle { player: PlayerSlot, index: u8 },
    Mode(bool),
    Show,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["toggle" | "t", player, index] => {
            let player = player
                .parse::<i64>()
                .ok()
                .and_then(|number| PlayerSlot::from_number(number).ok())
                .ok_or_else(|| "player must be 1 or 2".to_string())?;
            let index = index
                .parse::<u8>()
                .ok()
                .filter(|index| usize::from(*index) < shared::BOARD_SIZE)
                .ok_or_else(|| format!("cell must be 0-{}", shared::BOARD_SIZE - 1))?;
            Ok(Command::Toggle { player, index })
        }
        ["mode", "on"] => Ok(Command::Mode(true)),
        ["mode", "off"] => Ok(Command::Mode(false)),
        ["show" | "s"] => Ok(Command::Show),
        ["quit" | "q" | "exit"] => Ok(Command::Quit),
        _ => Err("commands: toggle <1|2> <cell>, mode <on|off>, show, quit".to_string()),
    }
}

/// A participant connected to one run's room
pub struct Client {
    run_id: String,
    challenges: Arc<Vec<Option<Challenge>>>,
    reconciler: Arc<Mutex<ProgressReconciler>>,
    backend: Arc<LiveBackend>,
    inbound: mpsc::UnboundedReceiver<Packet>,
}

impl Client {
    /// Opens the real-time channel and joins the run's room.
    pub async fn connect(server_addr: &str, http: HttpApi, run: RunView) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(server_addr).await?;
        stream.set_nodelay(true)?;
        info!("Connected to {}", server_addr);

        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        spawn_writer(writer, outbound_rx);
        spawn_reader(reader, inbound_tx);

        let backend = Arc::new(LiveBackend { http, outbound });
        backend.send(Packet::JoinRoom {
            room_id: run.id.clone(),
        })?;

        Ok(Client {
            run_id: run.id.clone(),
            reconciler: Arc::new(Mutex::new(ProgressReconciler::from_run(&run))),
            challenges: Arc::new(run.challenges),
            backend,
            inbound,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn reconciler(&self) -> Arc<Mutex<ProgressReconciler>> {
        Arc::clone(&self.reconciler)
    }

    /// Starts a toggle in the background. Toggles are not queued behind
    /// each other.
    pub fn toggle(&self, player: PlayerSlot, index: u8) -> JoinHandle<Result<Progress, ClientError>> {
        let reconciler = Arc::clone(&self.reconciler);
        let backend = Arc::clone(&self.backend);
        let challenges = Arc::clone(&self.challenges);
        let run_id = self.run_id.clone();

        tokio::spawn(async move {
            let result = sync_toggle(&reconciler, backend.as_ref(), &run_id, player, index).await;
            match &result {
                Ok(_) => info!("Saved player {} cell {}", player.number(), index),
                Err(e) => warn!("Reverted player {} cell {}: {}", player.number(), index, e),
            }
            println!("{}", render(&challenges, &*reconciler.lock().await));
            result
        })
    }

    /// Persists the mode flag, then tells the room.
    pub async fn set_mode(&self, two_player_mode: bool) -> Result<(), ClientError> {
        self.backend
            .http
            .update_mode(&self.run_id, two_player_mode)
            .await?;
        self.reconciler.lock().await.apply_mode(two_player_mode);
        self.backend.send(Packet::UpdateMode {
            room_id: self.run_id.clone(),
            two_player_mode,
        })
    }

    /// Next packet from the server, or None once the connection closed.
    pub async fn next_packet(&mut self) -> Option<Packet> {
        self.inbound.recv().await
    }

    /// Merges a server packet into the local state. Returns true when the
    /// board changed.
    pub async fn handle_packet(&self, packet: Packet) -> bool {
        let mut reconciler = self.reconciler.lock().await;
        match packet {
            Packet::PlayerProgressUpdated { player, progress } => {
                debug!("Player {} progress updated remotely", player.number());
                reconciler.apply_remote(player, progress);
                true
            }
            Packet::ProgressUpdated { progress } => {
                reconciler.apply_board_progress(progress);
                true
            }
            Packet::ModeUpdated { two_player_mode } => {
                info!("Two-player mode {}", if two_player_mode { "on" } else { "off" });
                reconciler.apply_mode(two_player_mode);
                true
            }
            Packet::RoomJoined { room_id } => {
                info!("Joined room {}", room_id);
                false
            }
            Packet::RoomLeft { room_id } => {
                info!("Left room {}", room_id);
                false
            }
            Packet::Error { message } => {
                error!("Server error: {}", message);
                false
            }
            other => {
                warn!("Unexpected packet from server: {:?}", other);
                false
            }
        }
    }

    pub async fn render(&self) -> String {
        render(&self.challenges, &*self.reconciler.lock().await)
    }

    pub fn leave(&self) -> Result<(), ClientError> {
        self.backend.send(Packet::LeaveRoom {
            room_id: self.run_id.clone(),
        })
    }

    /// Leaves the room and waits for the server's acknowledgement, which
    /// also means the leave frame has left the writer. Returns false when no
    /// acknowledgement arrived in time; the server still drops the membership
    /// once the connection closes.
    pub async fn leave_confirmed(&mut self) -> Result<bool, ClientError> {
        self.leave()?;

        let run_id = self.run_id.clone();
        let acknowledged = tokio::time::timeout(LEAVE_TIMEOUT, async {
            while let Some(packet) = self.next_packet().await {
                if matches!(&packet, Packet::RoomLeft { room_id } if *room_id == run_id) {
                    return true;
                }
                debug!("Ignoring packet while leaving: {:?}", packet);
            }
            false
        })
        .await
        .unwrap_or(false);

        if !acknowledged {
            warn!("Leave of room {} was not acknowledged", run_id);
        }
        Ok(acknowledged)
    }

    /// Interactive loop reading commands from stdin until quit or disconnect.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("{}", self.render().await);

        loop {
            tokio::select! {
                packet = self.next_packet() => {
                    match packet {
                        Some(packet) => {
                            if self.handle_packet(packet).await {
                                println!("{}", self.render().await);
                            }
                        }
                        None => {
                            warn!("Server closed the connection");
                            return Err(ClientError::ChannelClosed);
                        }
                    }
                },

                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_command(&line) {
                        Ok(Command::Toggle { player, index }) => {
                            // Completion is reported by the task itself
                            drop(self.toggle(player, index));
                        }
                        Ok(Command::Mode(flag)) => {
                            if let Err(e) = self.set_mode(flag).await {
                                error!("Failed to update mode: {}", e);
                            }
                        }
                        Ok(Command::Show) => println!("{}", self.render().await),
                        Ok(Command::Quit) => break,
                        Err(usage) => println!("{}", usage),
                    }
                },
            }
        }

        self.leave_confirmed().await?;
        Ok(())
    }
}

fn render(challenges: &[Option<Challenge>], reconciler: &ProgressReconciler) -> String {
    render_board(
        challenges,
        reconciler.player_progress(PlayerSlot::One),
        reconciler.player_progress(PlayerSlot::Two),
    )
}

/// Spawns task that writes queued packets to the server
fn spawn_writer(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Packet>) {
    tokio::spawn(async move {
        while let Some(packet) = outbound.recv().await {
            if let Err(e) = write_packet(&mut writer, &packet).await {
                error!("Error sending packet: {}", e);
                break;
            }
        }
    });
}

/// Spawns task that decodes packets from the server until the stream ends
fn spawn_reader(mut reader: OwnedReadHalf, inbound: mpsc::UnboundedSender<Packet>) {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(body)) => match decode_packet(&body) {
                    Ok(packet) => {
                        if inbound.send(packet).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to decode packet from server: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("Error receiving packet: {}", e);
                    break;
                }
            }
        }
    });
}
