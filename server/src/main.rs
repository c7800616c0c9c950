use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::console::run_console;
use server::game::InMemoryWorld;
use server::network::UdpTransport;
use server::runtime::{Collaborators, WorldServer};
use server::storage::InMemoryCharacterStore;
use server::workers::WorkerToken;
use std::path::PathBuf;
use std::sync::Arc;

/// Command line arguments. Flags override values from the config file.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// TOML configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Address to bind to, e.g. 127.0.0.1:8080
    #[clap(short, long)]
    bind: Option<String>,
    /// Turn duration in milliseconds
    #[clap(short, long)]
    turn_ms: Option<u64>,
    /// Inbound dispatcher workers
    #[clap(long)]
    dispatchers: Option<usize>,
    /// Low-priority processor workers
    #[clap(long)]
    processors: Option<usize>,
    /// Outbound sender workers
    #[clap(long)]
    senders: Option<usize>,
    /// Shared secret for inter-server messages
    #[clap(long)]
    peer_secret: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(turn_ms) = self.turn_ms {
            config.turn_duration_ms = turn_ms;
        }
        if let Some(n) = self.dispatchers {
            config.dispatcher_workers = n;
        }
        if let Some(n) = self.processors {
            config.processor_workers = n;
        }
        if let Some(n) = self.senders {
            config.sender_workers = n;
        }
        if let Some(secret) = self.peer_secret {
            config.peer_secret = secret;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    info!("Configuration: {:?}", config);

    let transport = UdpTransport::bind(&config.bind, config.connection_timeout()).await?;
    let server = Arc::new(WorldServer::new(
        config,
        Collaborators {
            transport: transport.clone(),
            simulation: Arc::new(InMemoryWorld::new()),
            store: Arc::new(InMemoryCharacterStore::default()),
        },
    ));

    let network = WorkerToken::new(0);
    let receiver = transport.spawn_receiver(
        Arc::clone(server.hub()),
        Arc::clone(server.sessions()),
        network.clone(),
    );
    let reaper = transport.spawn_reaper(network.clone());

    if let Err(e) = server.start().await {
        error!("Failed to start worker pools: {}", e);
        network.stop();
        server.shutdown().await;
        return Err(e.into());
    }

    tokio::select! {
        _ = run_console(Arc::clone(&server)) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    server.shutdown().await;
    network.stop();
    for task in [receiver, reaper] {
        if let Err(e) = task.await {
            error!("Network task ended abnormally: {}", e);
        }
    }
    Ok(())
}
