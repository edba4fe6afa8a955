//! Kolosal Explain - Main Entry Point

use clap::Parser;
use kolosal_explain::cli::{cmd_ale, cmd_anchor, cmd_list, Cli, Commands};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kolosal_explain=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::List => cmd_list()?,
        Commands::Ale { data, model, features, output } => {
            cmd_ale(&data, &model, features.as_deref(), output.as_deref(), config)?;
        }
        Commands::Anchor { data, model, row, threshold, seed } => {
            cmd_anchor(&data, &model, row, threshold, seed, config)?;
        }
        #[cfg(feature = "shap")]
        Commands::Shap { data, model, rows, background } => {
            kolosal_explain::cli::cmd_shap(&data, &model, rows, background, config)?;
        }
    }

    Ok(())
}
