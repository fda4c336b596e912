//! # Bingo Sync Server Library
//!
//! This library provides the authoritative side of the shared challenge board.
//! It owns the persisted run state, generates boards, and relays live progress
//! changes between everyone looking at the same run.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Run State
//! Runs and challenges live behind the [`store::RunStore`] trait. The store is
//! the only source of truth: a change is broadcast only after the store has
//! accepted it, and clients re-read from it on load.
//!
//! ### Room Management
//! Every run id doubles as a room. Connections join and leave rooms
//! explicitly; a disconnect removes the connection from every room it was in
//! before any later broadcast can see it.
//!
//! ### Live Fan-out
//! An update received from one connection is validated, persisted and then
//! sent to every other member of its room. Failures go back to the sender
//! only.
//!
//! ## Architecture Design
//!
//! ### Event Loop
//! One server loop owns all membership changes and processes connection
//! events in order. Each connection gets a reader and a writer task, and each
//! active room gets a worker task that applies that room's updates one at a
//! time. Rooms do not block one another.
//!
//! ### Framed TCP
//! The live channel is TCP carrying length-prefixed bincode frames, defined in
//! the `shared` crate. A frame that cannot be decoded is answered with an
//! error packet instead of closing the connection.
//!
//! ### Last Write Wins
//! Progress writes replace a player's whole set. Updates arriving over HTTP
//! bypass the room workers, so an HTTP write and a live write for the same
//! player simply race and the later one stays.
//!
//! ## Module Organization
//!
//! - [`store`]: persistence trait and the JSON-file/in-memory store
//! - [`runs`]: board generation on run creation, challenge resolution on load
//! - [`room_registry`]: connections and room membership
//! - [`broadcaster`]: persist-then-broadcast for each update kind
//! - [`room_worker`]: per-room serialized update queues
//! - [`network`]: TCP accept loop and main server loop
//! - [`api`]: HTTP routes for challenges and runs
//! - [`error`]: the error type shared by the HTTP and live surfaces
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use server::store::JsonStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(JsonStore::open("bingo.json").await?);
//!
//!     // HTTP surface on one port
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//!     let app = server::api::router(server::api::ApiState::new(store.clone()));
//!     tokio::spawn(async move { axum::serve(listener, app).await });
//!
//!     // Live channel on another, accepting up to 256 connections
//!     let server = Server::bind("127.0.0.1:8080", store, 256).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod broadcaster;
pub mod error;
pub mod network;
pub mod room_registry;
pub mod room_worker;
pub mod runs;
pub mod store;
