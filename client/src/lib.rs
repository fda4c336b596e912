//! # Bingo Sync Client Library
//!
//! This library provides the participant side of the shared challenge board:
//! loading a run over HTTP, marking cells, and keeping the local view in step
//! with everyone else in the same room.
//!
//! ## Architecture Overview
//!
//! ### Optimistic Updates
//! A toggle is applied to the local view at once, without waiting for the
//! server. The new progress set is then written over HTTP. When the write
//! succeeds the change is announced on the real-time channel; when it fails
//! the cell goes back to what it showed before the toggle.
//!
//! ### Remote Updates
//! Broadcasts from other participants replace the cached progress for that
//! player outright. There is no merging: the server's value wins.
//!
//! ## Module Organization
//!
//! - [`progress`]: the reconciler, the backend trait and the toggle flow
//! - [`http`]: the HTTP client for runs and progress writes
//! - [`network`]: the real-time connection and the interactive loop
//! - [`display`]: the text board and completion summary
//! - [`error`]: the client error type
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::http::HttpApi;
//! use client::network::Client;
//! use shared::PlayerSlot;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let http = HttpApi::new("http://127.0.0.1:3000");
//!     let run = http.create_run().await?;
//!
//!     let client = Client::connect("127.0.0.1:8080", http, run).await?;
//!
//!     // Mark cell 12 for player 1; reverted automatically if the save fails
//!     client.toggle(PlayerSlot::One, 12).await??;
//!     println!("{}", client.render().await);
//!
//!     Ok(())
//! }
//! ```

pub mod display;
pub mod error;
pub mod http;
pub mod network;
pub mod progress;
