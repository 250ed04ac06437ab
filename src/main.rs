mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use tunnel_engine::model::forwarding::ForwardConfig;
use tunnel_engine::transport::ConnectOptions;
use tunnel_engine::utils::logger;
use tunnel_engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            host,
            port,
            username,
            password,
            key,
            passphrase,
            forwards,
            keep_alive,
            connect_timeout,
            insecure: _,
        } => run(host, port, username, password, key, passphrase, forwards, keep_alive, connect_timeout).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    key: Option<std::path::PathBuf>,
    passphrase: Option<String>,
    forwards: Vec<cli::commands::ForwardSpec>,
    keep_alive: u64,
    connect_timeout: u64,
) -> anyhow::Result<()> {
    let engine = Engine::new();

    let opts = ConnectOptions {
        password,
        key_path: key,
        passphrase,
        keep_alive_interval_seconds: keep_alive,
        connect_timeout_seconds: connect_timeout,
        ..ConnectOptions::default()
    };

    tracing::info!(%host, port, %username, "connecting");
    let session = engine.connect(&host, port, &username, opts).await?;
    let session_identity = session.identity.clone();
    println!("connected: {}", session_identity);

    let mut started = Vec::new();
    for spec in forwards {
        let rule = spec.into_rule();
        let config = ForwardConfig::try_from(&rule)?;
        let identity = engine.add_forwarder(config, session_identity.clone()).await?;
        let identity = engine.start_forwarder(&identity, session.clone()).await?;
        println!("forwarder started: {}", identity);
        started.push(identity);
    }

    tokio::signal::ctrl_c().await?;
    println!("shutting down...");

    for identity in &started {
        if let Ok(status) = engine.forwarders.status(identity).await {
            println!(
                "{}: sent={} recv={} connections={}",
                status.id, status.bytes_sent, status.bytes_received, status.active_connections
            );
        }
    }

    engine.disconnect_session(&session_identity).await;
    Ok(())
}
