//! sandbox-session-mcp daemon
//!
//! MCP server that fronts a remote sandbox-execution provider with a
//! session and resource coordinator. Configuration is loaded from
//! `SANDBOX_MCP_*` environment variables.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sandbox_session_mcp::config::Config;
use sandbox_session_mcp::facade::Facade;
use sandbox_session_mcp::mcp;
use sandbox_session_mcp::provider::http::HttpProviderClient;
use sandbox_session_mcp::provider::ProviderClient;

#[derive(Parser, Debug)]
#[command(name = "sandbox-session-mcp")]
#[command(about = "MCP server fronting a remote sandbox-execution provider")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for the MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    info!(
        server_url = %config.server_url,
        max_sessions = config.max_sessions,
        default_flavor = %config.default_flavor,
        "loaded configuration"
    );

    let provider: Arc<dyn ProviderClient> =
        Arc::new(HttpProviderClient::new(config.server_url.clone(), config.api_key.clone())
            .context("failed to build sandbox provider client")?);
    let facade = Arc::new(Facade::new(config.clone(), provider));

    if args.stdio {
        mcp::serve_stdio(config, facade).await?;
    } else {
        anyhow::bail!("only --stdio mode is currently supported");
    }

    Ok(())
}
