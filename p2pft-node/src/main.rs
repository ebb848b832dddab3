// p2pft peer daemon: listen, register with the directory, share files, fetch requested ids.

use std::path::PathBuf;

use anyhow::Context;
use p2pft_core::catalog::collect_files;
use p2pft_node::{config, PeerNode, TransferMonitor};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_LOG_FILTER: &str = "p2pft_node=info,p2pft_core=info";

fn main() -> anyhow::Result<()> {
    let mut wanted = Vec::new();
    let mut share = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("p2pft-node {}", VERSION);
                return Ok(());
            }
            "--get" => {
                let id = args.next().context("--get needs a file id")?;
                wanted.push(
                    id.parse::<u32>()
                        .with_context(|| format!("invalid file id {:?}", id))?,
                );
            }
            path => share.push(PathBuf::from(path)),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let mut cfg = config::load().context("invalid configuration")?;
    cfg.share.extend(share);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, wanted))
}

async fn run(cfg: config::Config, wanted: Vec<u32>) -> anyhow::Result<()> {
    let node = PeerNode::bind(cfg.clone())
        .await
        .context("could not open a listening port")?;
    node.start().await?;

    if let Err(e) = node.connect_directory().await {
        warn!(error = %e, "directory server unreachable; sharing and lookups are unavailable");
    }

    let paths = cfg.share.clone();
    let items = tokio::task::spawn_blocking(move || collect_files(&paths)).await?;
    if !items.is_empty() {
        let added = node.add_local_files(items).await;
        info!(files = added, "sharing");
        if let Err(e) = node.announce_files(&node.local_files().await).await {
            warn!(error = %e, "shared files not announced");
        }
    }
    for file_id in wanted {
        if let Err(e) = node.request_file(file_id).await {
            warn!(file_id, error = %e, "lookup not sent");
        }
    }

    let monitor = tokio::spawn(TransferMonitor::new(node.clone(), &cfg).run());
    let inbox = {
        let node = node.clone();
        tokio::spawn(async move {
            loop {
                let msg = node.next_message().await;
                info!(connection = msg.connection, "{}", msg.text.trim_end());
            }
        })
    };

    shutdown_signal().await?;
    info!("shutting down");
    monitor.abort();
    inbox.abort();
    node.shutdown().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
