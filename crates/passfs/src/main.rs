//! CLI entry point: parses arguments, builds the backend, runs the server.
//!
//! No environment variables, no persisted state — configuration comes
//! entirely from the command line.

use std::path::PathBuf;

use clap::Parser;
use tokio::fs;

mod backend;
mod config;
mod fid;
mod identity;
mod path;
mod perm;
mod statconv;
mod utils;

use crate::backend::PassFs;
use crate::config::PassFsConfig;

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Directory to export
    exportdir: PathBuf,

    /// Reject any operation that would modify the export directory
    #[arg(long)]
    read_only: bool,

    /// Maximum directory depth to traverse below the export root
    #[arg(long, default_value_t = 200)]
    max_depth: usize,
}

async fn passfs_main(
    Cli {
        address,
        exportdir,
        read_only,
        max_depth,
    }: Cli,
) -> ninep_fs::Result<i32> {
    if !fs::try_exists(&exportdir).await? {
        return Err(ninep_fs::error::Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "export directory does not exist",
        )));
    }
    if !fs::metadata(&exportdir).await?.is_dir() {
        return Err(ninep_fs::error::Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "export path must be a directory",
        )));
    }

    let config = PassFsConfig::new(exportdir, read_only, max_depth)?;
    log::info!(
        "exporting {:?} (read_only={}, max_depth={})",
        config.root,
        config.read_only,
        config.max_depth
    );
    log::info!("listening on {}", address);

    ninep_fs::srv::srv_async(PassFs::new(config), &address)
        .await
        .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = passfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        log::error!("{:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
