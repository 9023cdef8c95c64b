//! Command-line driver: start an analysis server, open documents, issue a
//! request, and shut down cleanly.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use serde_json::Value as JsonValue;

use analysis_bridge::config::{read_config, read_config_from_path, ServerConfig};
use analysis_bridge::{BridgeContext, Result};

#[derive(Debug, Parser)]
#[command(name = "analysis-bridge", version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server executable, overriding the config file
    #[arg(long)]
    server: Option<PathBuf>,

    /// Arguments for --server
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    server_args: Vec<String>,

    /// Workspace root the server runs in
    #[arg(long)]
    root: Option<PathBuf>,

    /// Documents to open before issuing the request
    #[arg(long = "open")]
    open: Vec<PathBuf>,

    /// Method to call once the server is ready
    #[arg(long)]
    method: Option<String>,

    /// JSON params for --method
    #[arg(long, default_value = "null")]
    params: String,

    /// Scope the request to this document (sets params.textDocument)
    #[arg(long)]
    document: Option<PathBuf>,
}

impl Cli {
    fn load_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => read_config_from_path(path)?,
            None => read_config()?,
        };
        if let Some(server) = &self.server {
            config.executable = server.clone();
            config.args = self.server_args.clone();
        }
        if let Some(root) = &self.root {
            config.working_dir = Some(root.clone());
        }
        Ok(config)
    }
}

async fn run(cli: Cli) -> Result<()> {
    let context = BridgeContext::new(cli.load_config()?)?;
    context.start().await?;

    let outcome = drive(&context, &cli).await;

    if let Err(e) = context.shutdown().await {
        tracing::warn!("Shutdown failed: {}", e);
    }
    outcome
}

async fn drive(context: &BridgeContext, cli: &Cli) -> Result<()> {
    for path in &cli.open {
        let id = context.ensure_open(path).await?;
        println!("opened {}", id);
    }

    let Some(method) = &cli.method else {
        return Ok(());
    };
    let params: JsonValue = serde_json::from_str(&cli.params)?;

    let result = match &cli.document {
        Some(document) => context.document_request(document, method, params).await?,
        None => context.request(method, params).await?,
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    analysis_bridge::init_tracing();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
