//! logview: live tail of log files on remote servers.

use clap::Parser;
use logview::{Cli, Command, Config, Server, ServerSummary, SshConnector, default_config_path};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("logview=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("logview=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.unwrap_or_else(default_config_path);

    let result = match cli.command {
        Command::Serve { listen, static_dir } => run_server(&config_path, listen, static_dir).await,
        Command::Check { json } => run_check(&config_path, json),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_server(
    config_path: &Path,
    listen: SocketAddr,
    static_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    info!(
        path = %config_path.display(),
        servers = config.servers.len(),
        "configuration loaded"
    );

    let connector = Arc::new(SshConnector::new(config.stream.connect_timeout()));
    let mut server = Server::new(config, connector);
    if let Some(dir) = static_dir {
        server = server.with_static_dir(dir);
    }
    server.run(listen).await?;
    Ok(())
}

fn run_check(config_path: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    let servers: Vec<ServerSummary> = config.servers.iter().map(ServerSummary::from).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&servers)?);
    } else {
        let json_data = serde_json::json!({ "servers": servers });
        let toon = toon_format::encode(&json_data, &toon_format::EncodeOptions::default())
            .unwrap_or_else(|_| format!("{json_data:?}"));
        println!("{toon}");
    }
    Ok(())
}
