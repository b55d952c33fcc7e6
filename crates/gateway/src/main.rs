use std::sync::Arc;

use axum::routing::get;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use vx_domain::config::{Config, ConfigSeverity};
use vx_gateway::bus::EventBus;
use vx_gateway::cli::{Cli, Command, ConfigCommand};
use vx_gateway::state::AppState;
use vx_gateway::ws;
use vx_mcp::{LocalToolClient, McpClient, StdioMcpServer};
use vx_providers::PoolManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _path) = vx_gateway::cli::load_config(config_path)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, path) = vx_gateway::cli::load_config(config_path)?;
            let issues = config.validate();
            for issue in &issues {
                match issue.severity {
                    ConfigSeverity::Warning => println!("warning: {issue}"),
                    ConfigSeverity::Error => println!("error: {issue}"),
                }
            }
            let errors = issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count();
            println!(
                "{}: {} error(s), {} warning(s)",
                path.display(),
                errors,
                issues.len() - errors
            );
            if errors > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _path) = vx_gateway::cli::load_config(config_path)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("voxgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,vx_gateway=debug")),
        )
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("voxgate starting");

    // ── Config validation ──────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Shared MCP clients: local handlers + external servers ──────
    let mut shared_mcp: Vec<Arc<dyn McpClient>> = vec![Arc::new(LocalToolClient::new())];
    let mut stdio_servers: Vec<Arc<StdioMcpServer>> = Vec::new();
    for server_config in &config.mcp.servers {
        tracing::info!(
            server_id = %server_config.id,
            command = %server_config.command,
            "initializing MCP server"
        );
        match StdioMcpServer::initialize(server_config).await {
            Ok(server) => {
                let server = Arc::new(server);
                stdio_servers.push(server.clone());
                shared_mcp.push(server);
            }
            Err(e) => {
                tracing::warn!(
                    server_id = %server_config.id,
                    error = %e,
                    "failed to initialize MCP server, skipping"
                );
            }
        }
    }

    // ── Provider pools ─────────────────────────────────────────────
    let pools = Arc::new(PoolManager::from_config(&config, shared_mcp)?);
    if config.pool.warmup_on_start {
        pools.warmup().await;
    }

    let state = AppState {
        config: config.clone(),
        pools: pools.clone(),
        bus: EventBus::new(),
    };

    // ── HTTP server ────────────────────────────────────────────────
    let app = axum::Router::new()
        .route("/ws", get(ws::device_ws))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app).await?;

    pools.close().await;
    for server in &stdio_servers {
        server.shutdown().await;
    }
    Ok(())
}

async fn healthz(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "pools": state.pools.stats(),
    }))
}
