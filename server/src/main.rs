use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::network::Server;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Authoritative server for sphere tanks")]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,
    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "20")]
    tick_rate: u32,
    /// Maximum concurrent player sessions
    #[arg(short, long, default_value = "32")]
    max_clients: usize,
    /// Number of automated tanks
    #[arg(short, long, default_value = "48")]
    bots: usize,
    /// Terrain seed shared with clients
    #[arg(short, long, default_value = "1")]
    seed: u64,
    /// Seconds a disconnected player's tank is kept for a resume
    #[arg(long, default_value = "10")]
    reconnect_grace_secs: u64,
    /// Half-angle in degrees at which automated tanks enter a snapshot
    #[arg(long, default_value = "35")]
    interest_enter_deg: f64,
    /// Half-angle in degrees at which they leave it again
    #[arg(long, default_value = "45")]
    interest_leave_deg: f64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
            tick_rate: args.tick_rate.max(1),
            max_clients: args.max_clients,
            bot_count: args.bots,
            world_seed: args.seed,
            reconnect_grace: Duration::from_secs(args.reconnect_grace_secs),
            interest_enter_deg: args.interest_enter_deg,
            interest_leave_deg: args.interest_leave_deg,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    info!(
        "Starting server on {} at {} Hz with {} automated tanks",
        config.bind_addr(),
        config.tick_rate,
        config.bot_count
    );

    let mut server = Server::new(config).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
