use anyhow::Result;
use bitleech::client::TorrentClient;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bitleech", about = "Download the contents of a .torrent file")]
struct Cli {
    /// Path to a .torrent file
    torrent: PathBuf,
    /// Main output folder
    #[arg(short, long, default_value = "downloads")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Cli::parse();

    let mut client = TorrentClient::new(&args.torrent, &args.output).await?;
    let outcome = tokio::select! {
        result = client.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    match outcome {
        Some(result) => result?,
        None => {
            info!("interrupt received, stopping");
            client.stop().await;
        }
    }
    Ok(())
}
