use anyhow::Result;
use clap::Parser;
use print_audit::cli::{run_with_config, Cli};
use print_audit::logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = tracing::subscriber::with_default(logging::bootstrap(), || cli.settings())?;

    let (_guard, log_path) = logging::init(&config.paths.log_dir)?;
    tracing::info!(log_file = %log_path.display(), "trace_initialised");
    config.trace_loaded();

    let result = run_with_config(cli.into_command(), config).await;
    match &result {
        Ok(_) => tracing::info!("CLI completed successfully"),
        Err(e) => tracing::error!(error = %e, "CLI exited with error"),
    }
    result
}
