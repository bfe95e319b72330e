//! odoo-inspect-mcp daemon
//!
//! MCP server that runs inspection code inside a containerized Odoo stack.
//! Configuration comes from an optional JSON file and the `ODOO_*`
//! environment variables.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use odoo_inspect_mcp::{backend::DockerCli, config::Config, mcp, session::InspectSession};

#[derive(Parser, Debug)]
#[command(name = "odoo-inspect-mcp")]
#[command(about = "MCP server for inspecting a containerized Odoo runtime")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON configuration file; `ODOO_*` variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Container CLI to drive (docker or a compatible replacement)
    #[arg(long, default_value = "docker")]
    docker: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    info!(
        project = ?config.container_prefix,
        database = %config.database.name,
        exec_role = %config.exec_role,
        autostart = config.autostart,
        "Loaded configuration"
    );

    let docker = Arc::new(DockerCli::new(config.compose.clone()).with_program(args.docker));
    let session = InspectSession::new(config, Arc::clone(&docker) as _, docker);

    if args.stdio {
        mcp::serve_stdio(session).await?;
    } else {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    Ok(())
}
