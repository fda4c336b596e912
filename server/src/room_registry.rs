//! Connection and room membership management for the real-time server
//!
//! This module tracks every live connection and the rooms it has joined:
//! - Connection lifecycle (register, disconnect cleanup)
//! - Room membership (join, leave, member listing)
//! - Fan-out of outbound packets to a room's members
//! - Connection capacity limits
//!
//! A room is keyed by run id. A connection may sit in several rooms at once;
//! joining one room never leaves another, the client has to leave explicitly.

use log::{debug, info, warn};
use shared::Packet;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

pub type ConnectionId = u32;
pub type PacketSender = mpsc::UnboundedSender<Packet>;

/// A live connection and the rooms it currently belongs to
#[derive(Debug)]
pub struct Connection {
    /// Unique connection identifier assigned by the server
    pub id: ConnectionId,
    /// Remote address, for logging
    pub addr: SocketAddr,
    /// When the connection was accepted
    pub connected_at: Instant,
    /// Rooms this connection has joined and not yet left
    pub rooms: HashSet<String>,
    sender: PacketSender,
}

impl Connection {
    pub fn new(id: ConnectionId, addr: SocketAddr, sender: PacketSender) -> Self {
        Self {
            id,
            addr,
            connected_at: Instant::now(),
            rooms: HashSet::new(),
            sender,
        }
    }

    /// Queues a packet for the connection's writer task.
    ///
    /// Returns false when the writer is gone; the caller decides whether
    /// that matters (for fan-out it does not).
    pub fn send(&self, packet: Packet) -> bool {
        self.sender.send(packet).is_ok()
    }
}

/// Tracks which connections belong to which room
///
/// Membership changes are plain synchronous map updates. Callers share the
/// registry behind a lock, so a disconnect that has been processed is never
/// visible to a later fan-out.
pub struct RoomRegistry {
    /// Live connections indexed by id
    connections: HashMap<ConnectionId, Connection>,
    /// Members of each non-empty room
    rooms: HashMap<String, HashSet<ConnectionId>>,
    /// Next id handed to a new connection
    next_connection_id: ConnectionId,
    /// Maximum number of concurrent connections
    max_connections: usize,
}

impl RoomRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            rooms: HashMap::new(),
            next_connection_id: 1,
            max_connections,
        }
    }

    /// Registers a new connection
    ///
    /// Returns None when the server is at capacity.
    pub fn add_connection(&mut self, addr: SocketAddr, sender: PacketSender) -> Option<ConnectionId> {
        if self.connections.len() >= self.max_connections {
            return None;
        }

        let connection_id = self.next_connection_id;
        self.next_connection_id += 1;

        info!("Connection {} opened from {}", connection_id, addr);
        self.connections
            .insert(connection_id, Connection::new(connection_id, addr, sender));

        Some(connection_id)
    }

    /// Drops a connection and its membership in every room
    ///
    /// Returns the rooms it was removed from. Rooms left without members are
    /// forgotten.
    pub fn remove_connection(&mut self, connection_id: ConnectionId) -> Vec<String> {
        let Some(connection) = self.connections.remove(&connection_id) else {
            return Vec::new();
        };

        let mut left: Vec<String> = connection.rooms.into_iter().collect();
        left.sort();
        for room_id in &left {
            self.remove_member(room_id, connection_id);
        }

        info!(
            "Connection {} closed after {:?} ({} room(s) cleaned up)",
            connection_id,
            connection.connected_at.elapsed(),
            left.len()
        );
        left
    }

    /// Adds a connection to a room
    ///
    /// Returns true when it was not a member before. Joining twice is a no-op.
    pub fn join(&mut self, connection_id: ConnectionId, room_id: &str) -> bool {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            warn!("Unknown connection {} tried to join {}", connection_id, room_id);
            return false;
        };

        if !connection.rooms.insert(room_id.to_string()) {
            debug!("Connection {} already in room {}", connection_id, room_id);
            return false;
        }

        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id);
        info!("Connection {} joined room {}", connection_id, room_id);
        true
    }

    /// Removes a connection from a room
    ///
    /// Returns true when it was a member.
    pub fn leave(&mut self, connection_id: ConnectionId, room_id: &str) -> bool {
        let was_member = self
            .connections
            .get_mut(&connection_id)
            .map(|connection| connection.rooms.remove(room_id))
            .unwrap_or(false);

        if was_member {
            self.remove_member(room_id, connection_id);
            info!("Connection {} left room {}", connection_id, room_id);
        }
        was_member
    }

    fn remove_member(&mut self, room_id: &str, connection_id: ConnectionId) {
        if let Some(members) = self.rooms.get_mut(room_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                self.rooms.remove(room_id);
            }
        }
    }

    /// Current members of a room, in id order
    pub fn members(&self, room_id: &str) -> Vec<ConnectionId> {
        self.members_except(room_id, None)
    }

    /// Current members of a room other than `exclude`, in id order
    pub fn members_except(&self, room_id: &str, exclude: Option<ConnectionId>) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> = self
            .rooms
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .copied()
                    .filter(|id| Some(*id) != exclude)
                    .collect()
            })
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    /// Sends a packet to a single connection. Unknown connections are ignored.
    pub fn send_to(&self, connection_id: ConnectionId, packet: Packet) -> bool {
        match self.connections.get(&connection_id) {
            Some(connection) => connection.send(packet),
            None => false,
        }
    }

    /// Sends a packet to every member of a room except `exclude`
    ///
    /// Delivery is fire-and-forget: a member whose writer has gone away is
    /// logged and skipped. Returns how many members the packet was queued for.
    pub fn fan_out(&self, room_id: &str, exclude: Option<ConnectionId>, packet: &Packet) -> usize {
        let mut delivered = 0;
        for member in self.members_except(room_id, exclude) {
            if self.send_to(member, packet.clone()) {
                delivered += 1;
            } else {
                warn!("Dropped packet for connection {} in room {}", member, room_id);
            }
        }
        delivered
    }

    /// Rooms a connection currently belongs to, sorted
    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .connections
            .get(&connection_id)
            .map(|connection| connection.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Returns the number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no connections are live
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
