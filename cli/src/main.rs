use anyhow::Result;
use clap::Parser;

use embedq_cli::output::OutputMode;
use embedq_cli::{AppContext, Cli, handlers};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("embedq=info".parse()?),
        )
        .init();

    let ctx = AppContext::from_cli(&cli).await?;
    handlers::execute(&cli.command, &ctx, OutputMode::from_json_flag(cli.json)).await
}
