//! # Sphere Tanks Client
//!
//! The player-facing half of the game: it captures input, predicts the local
//! tank, talks to the authority over UDP and draws the sphere as an
//! equirectangular map.
//!
//! ## Architecture Overview
//!
//! ### Client-Side Prediction
//! Input samples are applied to the local tank immediately with the same
//! motion solver the server runs, so driving feels instant despite latency.
//!
//! ### Server Reconciliation
//! Each snapshot carries the last input sequence the server applied. The
//! client drops the confirmed samples, restarts from the authoritative state
//! and replays the rest. Small differences are blended out over a few ticks;
//! large ones snap.
//!
//! ### Interpolation
//! Other tanks are drawn between their two most recent snapshot states.
//!
//! ### Reliability
//! Snapshots and inputs are best-effort. Fire requests are resent until the
//! server acknowledges them, and reliable events are acknowledged and applied
//! once even when they arrive more than once.
//!
//! ## Module Organization
//!
//! - `prediction`: the input buffer and reconciliation
//! - `game`: session state, remote tanks, territory, feeds
//! - `input`: keyboard and mouse sampling, sequencing, fire charge, chat
//! - `network`: the socket thread, fire retransmission and the frame loop
//! - `rendering`: the macroquad map and HUD
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use client::network::Client;
//!
//! #[macroquad::main("Sphere Tanks")]
//! async fn main() {
//!     let mut client = Client::new("127.0.0.1:8080", 0, 1200, 690).unwrap();
//!     client.run().await.unwrap();
//! }
//! ```

pub mod game;
pub mod input;
pub mod network;
pub mod prediction;
pub mod rendering;
