//! Kolosal Fusion NAS - Main Entry Point

use clap::Parser;
use kolosal_fusion_nas::cli::{run, Cli};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kolosal_fusion_nas=info".into()),
        )
        .init();

    run(Cli::parse())
}
