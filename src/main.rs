use anyhow::{Context, Result};
use clap::Parser;

use segfetch::cli::Args;
use segfetch::commands;
use segfetch::config::TransferConfig;

fn main() -> Result<()> {
    let mut args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_filter()))
        .format_timestamp_millis()
        .init();

    // Output dir might not exist yet, so we resolve it relative to current dir
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    let mut config = match &args.config {
        Some(path) => TransferConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => TransferConfig::default(),
    };
    args.apply_to(&mut config);
    config.validate().context("Invalid settings")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        if args.list {
            return commands::list_downloads(args.download_dir).await;
        }

        let Some(url) = args.url else {
            anyhow::bail!("No URL given");
        };
        let output = commands::run_single_download(url, args.download_dir, config).await?;
        println!("Download complete: {}", output.display());
        Ok(())
    })
}
