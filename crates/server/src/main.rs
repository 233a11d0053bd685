mod config;
mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use config::ServerConfig;
use server::GameServer;

#[derive(Parser)]
#[command(name = "vortex-server")]
#[command(about = "Vortex game session server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = 27500)]
    port: u16,

    #[arg(long, env = "VORTEX_SECRET", default_value = "changeme")]
    secret: String,

    #[arg(long, default_value_t = 90, help = "Idle connection timeout in seconds")]
    idle_timeout: u64,

    #[arg(long, help = "Create an auto-join session with this id on startup")]
    open_session: Option<u64>,

    #[arg(long, default_value = "freeplay", help = "Mode of the auto-join session")]
    open_session_mode: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = ServerConfig {
        bind: args.bind,
        port: args.port,
        secret: args.secret,
        idle_timeout: Duration::from_secs(args.idle_timeout),
        open_session: args.open_session,
        open_session_mode: args.open_session_mode,
        ..Default::default()
    };

    let server = Arc::new(GameServer::new(config));
    server.run().await?;
    log::info!("server stopped");
    Ok(())
}
