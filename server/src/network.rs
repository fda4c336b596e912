//! Server network layer handling TCP connections and room coordination

use crate::broadcaster::RoomBroadcaster;
use crate::room_registry::{ConnectionId, RoomRegistry};
use crate::room_worker::{RoomCommand, RoomWorkers};
use crate::store::RunStore;
use log::{debug, error, info, warn};
use shared::{decode_packet, read_frame, write_packet, Packet, ValidationError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Messages sent from connection tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        connection_id: ConnectionId,
        packet: Packet,
    },
    MalformedPacket {
        connection_id: ConnectionId,
        reason: String,
    },
    Disconnected {
        connection_id: ConnectionId,
    },
    Shutdown,
}

/// Asks a running server to stop
#[derive(Clone)]
pub struct ShutdownHandle {
    server_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if self.server_tx.send(ServerMessage::Shutdown).is_err() {
            debug!("Shutdown requested after the server loop ended");
        }
    }
}

/// Real-time server owning room membership and the per-room workers
pub struct Server {
    listener: TcpListener,
    registry: Arc<RwLock<RoomRegistry>>,
    workers: RoomWorkers,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        store: Arc<dyn RunStore>,
        max_connections: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Real-time server listening on {}", listener.local_addr()?);

        let registry = Arc::new(RwLock::new(RoomRegistry::new(max_connections)));
        let broadcaster = Arc::new(RoomBroadcaster::new(store, Arc::clone(&registry)));
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener,
            registry,
            workers: RoomWorkers::new(broadcaster),
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<RwLock<RoomRegistry>> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            server_tx: self.server_tx.clone(),
        }
    }

    /// Main server loop. Returns once a shutdown is requested.
    pub async fn run(self) -> io::Result<()> {
        let Server {
            listener,
            registry,
            mut workers,
            server_tx,
            mut server_rx,
        } = self;

        let acceptor = spawn_acceptor(listener, Arc::clone(&registry), server_tx);
        info!("Server started successfully");

        while let Some(message) = server_rx.recv().await {
            match message {
                ServerMessage::PacketReceived {
                    connection_id,
                    packet,
                } => {
                    handle_packet(&registry, &mut workers, connection_id, packet).await;
                }
                ServerMessage::MalformedPacket {
                    connection_id,
                    reason,
                } => {
                    warn!("Malformed packet from connection {}: {}", connection_id, reason);
                    let message = ValidationError::MalformedPacket(reason).to_string();
                    registry
                        .read()
                        .await
                        .send_to(connection_id, Packet::Error { message });
                }
                ServerMessage::Disconnected { connection_id } => {
                    let emptied: Vec<String> = {
                        let mut registry = registry.write().await;
                        registry
                            .remove_connection(connection_id)
                            .into_iter()
                            .filter(|room_id| !registry.has_room(room_id))
                            .collect()
                    };
                    for room_id in emptied {
                        workers.retire(&room_id);
                    }
                }
                ServerMessage::Shutdown => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        acceptor.abort();
        workers.shutdown().await;
        Ok(())
    }
}

/// Processes one inbound packet from a registered connection
async fn handle_packet(
    registry: &RwLock<RoomRegistry>,
    workers: &mut RoomWorkers,
    connection_id: ConnectionId,
    packet: Packet,
) {
    let (room_id, command) = match packet {
        Packet::JoinRoom { room_id } => {
            let mut registry = registry.write().await;
            registry.join(connection_id, &room_id);
            registry.send_to(connection_id, Packet::RoomJoined { room_id });
            return;
        }

        Packet::LeaveRoom { room_id } => {
            let emptied = {
                let mut registry = registry.write().await;
                registry.leave(connection_id, &room_id);
                registry.send_to(
                    connection_id,
                    Packet::RoomLeft {
                        room_id: room_id.clone(),
                    },
                );
                !registry.has_room(&room_id)
            };
            if emptied {
                workers.retire(&room_id);
            }
            return;
        }

        Packet::UpdateProgress { room_id, progress } => (
            room_id,
            RoomCommand::Progress {
                origin: connection_id,
                progress,
            },
        ),

        Packet::UpdatePlayerProgress {
            room_id,
            player,
            progress,
        } => (
            room_id,
            RoomCommand::PlayerProgress {
                origin: connection_id,
                player,
                progress,
            },
        ),

        Packet::UpdateMode {
            room_id,
            two_player_mode,
        } => (
            room_id,
            RoomCommand::Mode {
                origin: connection_id,
                two_player_mode,
            },
        ),

        other => {
            warn!("Unexpected packet from connection {}: {:?}", connection_id, other);
            registry.read().await.send_to(
                connection_id,
                Packet::Error {
                    message: ValidationError::MalformedPacket("unexpected packet type".to_string())
                        .to_string(),
                },
            );
            return;
        }
    };

    workers.dispatch(&room_id, command);

    // An update for a room nobody is in still runs, but needs no standing worker
    if !registry.read().await.has_room(&room_id) {
        workers.retire(&room_id);
    }
}

/// Spawns task that accepts connections and starts their reader and writer tasks
fn spawn_acceptor(
    listener: TcpListener,
    registry: Arc<RwLock<RoomRegistry>>,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    accept_connection(stream, addr, &registry, &server_tx).await;
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    })
}

async fn accept_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: &RwLock<RoomRegistry>,
    server_tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", addr, e);
    }

    let (reader, mut writer) = stream.into_split();
    let (packet_tx, packet_rx) = mpsc::unbounded_channel();

    let connection_id = registry.write().await.add_connection(addr, packet_tx);
    let Some(connection_id) = connection_id else {
        warn!("Rejecting connection from {}: server full", addr);
        let rejection = Packet::Error {
            message: "Server full".to_string(),
        };
        if let Err(e) = write_packet(&mut writer, &rejection).await {
            debug!("Failed to send rejection to {}: {}", addr, e);
        }
        return;
    };

    spawn_writer(connection_id, writer, packet_rx);
    spawn_reader(connection_id, reader, server_tx.clone());
}

/// Spawns task that drains a connection's outbound queue onto its socket
fn spawn_writer(
    connection_id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut packet_rx: mpsc::UnboundedReceiver<Packet>,
) {
    tokio::spawn(async move {
        while let Some(packet) = packet_rx.recv().await {
            if let Err(e) = write_packet(&mut writer, &packet).await {
                debug!("Write to connection {} failed: {}", connection_id, e);
                break;
            }
        }
    });
}

/// Spawns task that decodes frames from a connection until it closes
fn spawn_reader(
    connection_id: ConnectionId,
    mut reader: OwnedReadHalf,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    tokio::spawn(async move {
        loop {
            let message = match read_frame(&mut reader).await {
                Ok(Some(body)) => match decode_packet(&body) {
                    Ok(packet) => ServerMessage::PacketReceived {
                        connection_id,
                        packet,
                    },
                    Err(e) => ServerMessage::MalformedPacket {
                        connection_id,
                        reason: e.to_string(),
                    },
                },
                Ok(None) => break,
                Err(e) => {
                    // Oversized or truncated frames leave the stream unusable
                    warn!("Closing connection {}: {}", connection_id, e);
                    break;
                }
            };

            if server_tx.send(message).is_err() {
                return;
            }
        }

        if let Err(e) = server_tx.send(ServerMessage::Disconnected { connection_id }) {
            debug!("Server loop gone before disconnect of {}: {}", connection_id, e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonStore;
    use shared::{encode_packet, PlayerSlot, Progress};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    const WAIT: Duration = Duration::from_secs(2);

    async fn start(max_connections: usize) -> (SocketAddr, Arc<RwLock<RoomRegistry>>, ShutdownHandle) {
        let store = Arc::new(JsonStore::in_memory());
        store.create_run("run-1", (1..=25).collect()).await.unwrap();

        let server = Server::bind("127.0.0.1:0", store, max_connections).await.unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        let shutdown = server.shutdown_handle();
        tokio::spawn(server.run());
        (addr, registry, shutdown)
    }

    async fn recv(stream: &mut TcpStream) -> Packet {
        let body = tokio::time::timeout(WAIT, read_frame(stream))
            .await
            .expect("timed out waiting for a packet")
            .unwrap()
            .expect("connection closed");
        decode_packet(&body).unwrap()
    }

    async fn join(addr: SocketAddr, room_id: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let join = Packet::JoinRoom {
            room_id: room_id.to_string(),
        };
        write_packet(&mut stream, &join).await.unwrap();
        assert_eq!(
            recv(&mut stream).await,
            Packet::RoomJoined {
                room_id: room_id.to_string()
            }
        );
        stream
    }

    #[tokio::test]
    async fn test_update_reaches_other_member() {
        let (addr, _registry, shutdown) = start(8).await;
        let mut a = join(addr, "run-1").await;
        let mut b = join(addr, "run-1").await;

        let update = Packet::UpdatePlayerProgress {
            room_id: "run-1".to_string(),
            player: 1,
            progress: vec![2, 5],
        };
        write_packet(&mut a, &update).await.unwrap();

        assert_eq!(
            recv(&mut b).await,
            Packet::PlayerProgressUpdated {
                player: PlayerSlot::One,
                progress: Progress::try_from_indices([2, 5]).unwrap(),
            }
        );
        shutdown.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_frame_answered_with_error() {
        let (addr, _registry, shutdown) = start(8).await;
        let mut stream = join(addr, "run-1").await;

        stream.write_all(&3u32.to_be_bytes()).await.unwrap();
        stream.write_all(&[0xff, 0xff, 0xff]).await.unwrap();

        match recv(&mut stream).await {
            Packet::Error { message } => assert!(message.starts_with("Malformed packet")),
            other => panic!("expected error, got {:?}", other),
        }
        shutdown.shutdown();
    }

    #[tokio::test]
    async fn test_outbound_packet_from_client_is_rejected() {
        let (addr, _registry, shutdown) = start(8).await;
        let mut stream = join(addr, "run-1").await;

        let bogus = encode_packet(&Packet::ModeUpdated {
            two_player_mode: true,
        })
        .unwrap();
        stream.write_all(&bogus).await.unwrap();

        assert!(matches!(recv(&mut stream).await, Packet::Error { .. }));
        shutdown.shutdown();
    }

    #[tokio::test]
    async fn test_server_full_rejects_connection() {
        let (addr, registry, shutdown) = start(1).await;
        let _first = join(addr, "run-1").await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        assert_eq!(
            recv(&mut second).await,
            Packet::Error {
                message: "Server full".to_string()
            }
        );
        assert_eq!(registry.read().await.len(), 1);
        shutdown.shutdown();
    }

    #[tokio::test]
    async fn test_leave_acknowledged_and_membership_dropped() {
        let (addr, registry, shutdown) = start(8).await;
        let mut stream = join(addr, "run-1").await;

        let leave = Packet::LeaveRoom {
            room_id: "run-1".to_string(),
        };
        write_packet(&mut stream, &leave).await.unwrap();
        assert_eq!(
            recv(&mut stream).await,
            Packet::RoomLeft {
                room_id: "run-1".to_string()
            }
        );
        assert!(!registry.read().await.has_room("run-1"));
        shutdown.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_membership() {
        let (addr, registry, shutdown) = start(8).await;
        let stream = join(addr, "run-1").await;
        let _other = join(addr, "run-2").await;
        drop(stream);

        let cleaned = tokio::time::timeout(WAIT, async {
            loop {
                if !registry.read().await.has_room("run-1") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        tokio_test::assert_ok!(cleaned);
        assert!(registry.read().await.has_room("run-2"));
        shutdown.shutdown();
    }
}
