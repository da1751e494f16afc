use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use keel_engine::Services;
use keel_server::ServerConfig;
use keel_settings::{keel_home, load_settings, KeelSettings};
use keel_store::Database;
use keel_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "keel", version, about = "Session, context and reality tracking hub")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub (default).
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Query a running hub's health endpoint.
    Health {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the registered tool definitions as JSON.
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings().context("loading ~/.keel/settings.json")?;

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Serve { host, port } => serve(settings, host, port).await,
        Command::Health { port } => health(&settings, port).await,
        Command::Tools => {
            let services = Services::new(Database::in_memory()?, settings);
            println!(
                "{}",
                serde_json::to_string_pretty(&services.registry.definitions())?
            );
            Ok(())
        }
    }
}

async fn serve(settings: KeelSettings, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let home = keel_home();
    let _telemetry = init_telemetry(TelemetryConfig {
        log_to_sqlite: settings.logging.persist_warnings,
        log_db_path: home.join("database").join("logs.db"),
        ..TelemetryConfig::default().with_level_str(&settings.logging.level)
    });

    let db_path = settings.database.resolve(&home);
    let db = Database::open(&db_path)
        .with_context(|| format!("opening database at {}", db_path.display()))?;

    let mut config = ServerConfig::from(&settings.server);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let services = Arc::new(Services::new(db, settings));
    tracing::info!(tools = services.registry.count(), "starting keel");
    let handle = keel_server::start(config, services)
        .await
        .context("starting hub")?;

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn health(settings: &KeelSettings, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or(settings.server.port);
    let url = format!("http://{}:{}/health", settings.server.host, port);
    let resp = reqwest::get(&url)
        .await
        .with_context(|| format!("requesting {url}"))?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("decoding health response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        bail!("hub reports {}", body["status"].as_str().unwrap_or("unknown"));
    }
    Ok(())
}
