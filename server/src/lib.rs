//! # Sphere Tanks Authority
//!
//! The authoritative server for a multiplayer tank game played on the surface
//! of a sphere. It owns the canonical world state, validates and applies
//! client inputs, runs automated tanks, and sends every client a snapshot
//! filtered to what that client can see.
//!
//! ## Tick Pipeline
//!
//! Each tick runs the same fixed sequence of stages:
//! 1. Expire sessions whose reconnect grace ran out
//! 2. Apply buffered human inputs (a bounded number per client)
//! 3. Exchange requests and commands with the automated-tank worker
//! 4. Integrate motion against the terrain for every tank
//! 5. Spawn, move and collide projectiles
//! 6. Update territory capture and ownership
//! 7. Queue reliable events, then per-observer snapshots
//!
//! Stages that panic are contained: the tick keeps the previous state for
//! that stage and the loop carries on.
//!
//! ## Module Organization
//!
//! - `scheduler`: wall-clock tick deadlines and stage guarding
//! - `client_manager`: sessions, input buffers, reconnect grace
//! - `game`: world state and the step pipeline
//! - `projectiles`: swept projectile flight and hit resolution
//! - `capture`: territory capture and hysteretic region membership
//! - `interest`: per-observer snapshot filtering
//! - `bots`: the non-blocking automated-tank worker
//! - `reliable`: per-client retransmission of rare events
//! - `network`: UDP tasks and the main select loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         port: 8080,
//!         bot_count: 48,
//!         ..ServerConfig::default()
//!     };
//!     let mut server = Server::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod bots;
pub mod capture;
pub mod client_manager;
pub mod config;
pub mod game;
pub mod interest;
pub mod network;
pub mod projectiles;
pub mod reliable;
pub mod scheduler;
