//! Server configuration: CLI flags via `clap`, optionally merged with a
//! TOML file. CLI flags take precedence over the file.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::CsapResult;

#[derive(Parser, Debug)]
#[command(name = "csap-server", about = "Multi-user remote file service")]
pub struct Args {
    /// Directory backing the exported filesystem.
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Address to bind.
    #[arg(long)]
    pub ip: Option<String>,

    /// Port to bind.
    #[arg(long)]
    pub port: Option<u16>,

    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or "debug".
    #[arg(long)]
    pub log_filter: Option<String>,

    /// Optional TOML file supplying any of the fields above.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Fields mergeable from a `--config` TOML file; CLI flags win on conflict.
#[derive(Deserialize, Default)]
struct FileConfig {
    root: Option<PathBuf>,
    ip: Option<String>,
    port: Option<u16>,
    log_filter: Option<String>,
    max_users: Option<usize>,
    max_transfers: Option<usize>,
}

/// Fully resolved configuration the rest of the crate operates on.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub ip: String,
    pub port: u16,
    pub log_filter: String,
    pub max_users: usize,
    pub max_transfers: usize,
}

impl Config {
    pub fn resolve(args: Args) -> CsapResult<Config> {
        let file = match &args.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str::<FileConfig>(&raw)
                    .map_err(|err| crate::error::CsapError::invalid(format!("bad config file: {err}")))?
            }
            None => FileConfig::default(),
        };

        let root = args.root.or(file.root).unwrap_or_else(|| PathBuf::from("./server_root"));
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir().map(|cwd| cwd.join(&root)).unwrap_or(root)
        };

        Ok(Config {
            root,
            ip: args.ip.or(file.ip).unwrap_or_else(|| "127.0.0.1".to_string()),
            port: args.port.or(file.port).unwrap_or(8080),
            log_filter: args.log_filter.or(file.log_filter).unwrap_or_else(|| "info".to_string()),
            max_users: file.max_users.unwrap_or(128),
            max_transfers: file.max_transfers.unwrap_or(128),
        })
    }
}
