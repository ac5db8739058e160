//! Command-line surface and the command implementations behind it.

use crate::balance::rebalance::Rebalancer;
use crate::config::{Config, default_config_path};
use crate::dav;
use crate::error::PoolError;
use crate::pool::Pool;
use crate::pool::verify::VerifyMode;
use crate::transport::rclone::RcloneTransport;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

// Process exit codes: 0 ok, 1 failure, 2 usage (clap), 3 not found,
// 4 partial failure.
pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_NOT_FOUND: i32 = 3;
pub const EXIT_PARTIAL: i32 = 4;

#[derive(Parser)]
#[command(
    name = "rclonepool",
    version,
    about = "Distribute files as chunks across multiple rclone remotes"
)]
pub struct Cli {
    /// Config file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config file to edit
    Init,
    /// Upload a file into the pool
    Upload {
        #[arg(value_name = "LOCAL_PATH")]
        local_path: PathBuf,
        #[arg(value_name = "REMOTE_PATH")]
        remote_path: String,
    },
    /// Download a file from the pool
    Download {
        #[arg(value_name = "REMOTE_PATH")]
        remote_path: String,
        #[arg(value_name = "LOCAL_PATH")]
        local_path: PathBuf,
    },
    /// List files in the pool
    Ls {
        #[arg(value_name = "DIR", default_value = "/")]
        dir: String,
    },
    /// Delete a file and all its chunks
    Delete {
        #[arg(value_name = "REMOTE_PATH")]
        remote_path: String,
    },
    /// Show space usage of all remotes
    Status,
    /// Start the WebDAV server
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Check that chunks exist (and match their sizes with --full)
    Verify {
        #[arg(value_name = "REMOTE_PATH")]
        remote_path: Option<String>,
        #[arg(long)]
        full: bool,
    },
    /// Re-upload missing chunks from a local copy of the file
    Repair {
        #[arg(value_name = "REMOTE_PATH")]
        remote_path: String,
        #[arg(value_name = "LOCAL_PATH")]
        local_path: PathBuf,
    },
    /// Find chunks no manifest references
    Orphans {
        #[arg(long)]
        delete: bool,
    },
    /// Even out chunk placement across remotes
    Rebalance {
        #[arg(long)]
        dry_run: bool,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if let Commands::Init = cli.command {
        return init(&config_path);
    }

    let config = Config::load_or_default(&config_path)?;
    let pool = open_pool(config.clone()).await?;

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Upload {
            local_path,
            remote_path,
        } => {
            let outcome = pool.upload(&local_path, &remote_path).await?;
            println!(
                "uploaded {} ({} bytes, {} chunks across {})",
                outcome.manifest.file_path,
                outcome.manifest.file_size,
                outcome.manifest.chunk_count,
                outcome.manifest.remotes().join(", ")
            );
            Ok(EXIT_OK)
        }
        Commands::Download {
            remote_path,
            local_path,
        } => match pool.download_to_file(&remote_path, &local_path).await {
            Ok(written) => {
                println!("downloaded {remote_path} -> {} ({written} bytes)", local_path.display());
                Ok(EXIT_OK)
            }
            Err(e) => Ok(report(e)),
        },
        Commands::Ls { dir } => {
            let files = pool.list(&dir).await?;
            if files.is_empty() {
                println!("no files found");
            }
            for file in files {
                println!(
                    "{:<50} {:>14} bytes  {:>4} chunks  remotes: {}",
                    file.file_path,
                    file.file_size,
                    file.chunk_count,
                    file.remotes.join(", ")
                );
            }
            Ok(EXIT_OK)
        }
        Commands::Delete { remote_path } => match pool.delete(&remote_path).await {
            Ok(outcome) => {
                println!(
                    "deleted {remote_path} ({} chunks, {} failed)",
                    outcome.chunks_deleted, outcome.chunks_failed
                );
                Ok(if outcome.chunks_failed > 0 {
                    EXIT_PARTIAL
                } else {
                    EXIT_OK
                })
            }
            Err(e) => Ok(report(e)),
        },
        Commands::Status => {
            for view in pool.status().await {
                if view.reachable {
                    println!(
                        "{:<20} used: {:>14}  free: {:>14}  total: {:>14}",
                        view.remote, view.space.used, view.space.free, view.space.total
                    );
                } else {
                    println!("{:<20} unreachable", view.remote);
                }
            }
            Ok(EXIT_OK)
        }
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.webdav_host.clone());
            let port = port.unwrap_or(config.webdav_port);
            dav::serve(pool, &host, port).await?;
            Ok(EXIT_OK)
        }
        Commands::Verify { remote_path, full } => {
            let mode = if full { VerifyMode::Full } else { VerifyMode::Quick };
            let reports = match remote_path {
                Some(path) => match pool.verify(&path, mode).await {
                    Ok(report) => vec![report],
                    Err(e) => return Ok(report(e)),
                },
                None => pool.verify_all(mode).await?,
            };
            let failed = reports.iter().filter(|r| !r.ok()).count();
            for r in &reports {
                if r.ok() {
                    println!("{}: ok ({} chunks)", r.file_path, r.total_chunks);
                } else {
                    println!(
                        "{}: {} missing, {} wrong-size of {} chunks",
                        r.file_path,
                        r.missing.len(),
                        r.wrong_size.len(),
                        r.total_chunks
                    );
                }
            }
            println!("{} of {} files passed", reports.len() - failed, reports.len());
            Ok(if failed > 0 { EXIT_PARTIAL } else { EXIT_OK })
        }
        Commands::Repair {
            remote_path,
            local_path,
        } => match pool.repair(&remote_path, &local_path).await {
            Ok(outcome) => {
                println!(
                    "repaired {} chunks, {} still damaged",
                    outcome.repaired.len(),
                    outcome.still_damaged.len()
                );
                Ok(if outcome.still_damaged.is_empty() {
                    EXIT_OK
                } else {
                    EXIT_PARTIAL
                })
            }
            Err(e) => Ok(report(e)),
        },
        Commands::Orphans { delete } => {
            let orphans = pool.orphans().await?;
            for orphan in &orphans {
                println!("{}{}", orphan.remote, orphan.path);
            }
            println!("{} orphaned chunks", orphans.len());
            if delete && !orphans.is_empty() {
                let deleted = pool.delete_orphans(&orphans).await;
                println!("deleted {deleted} of {}", orphans.len());
                if deleted < orphans.len() {
                    return Ok(EXIT_PARTIAL);
                }
            }
            Ok(EXIT_OK)
        }
        Commands::Rebalance { dry_run } => {
            let rebalancer = Rebalancer::new(
                pool.transport().clone(),
                pool.manifests().clone(),
                pool.remotes().to_vec(),
            );
            let analysis = rebalancer.analyze().await?;
            for (remote, count) in &analysis.counts {
                println!("{remote:<20} {count} chunks");
            }
            println!("{} chunks total, ideal {} per remote", analysis.total_chunks, analysis.ideal);

            let moves = rebalancer.plan().await?;
            if moves.is_empty() {
                println!("pool is balanced, nothing to move");
                return Ok(EXIT_OK);
            }
            if dry_run {
                for mv in &moves {
                    println!(
                        "would move chunk {} of {} from {} to {}",
                        mv.chunk_index, mv.file_path, mv.source, mv.target
                    );
                }
                return Ok(EXIT_OK);
            }
            let outcome = rebalancer.execute(moves).await;
            println!("moved {} chunks, {} failed", outcome.moved.len(), outcome.failed);
            Ok(if outcome.failed > 0 { EXIT_PARTIAL } else { EXIT_OK })
        }
    }
}

fn init(config_path: &std::path::Path) -> anyhow::Result<i32> {
    if config_path.exists() {
        println!("config already exists at {}", config_path.display());
        return Ok(EXIT_OK);
    }
    let config = Config::default();
    config.save(config_path)?;
    println!("wrote default config to {}", config_path.display());
    println!("edit it to add your remotes, then try:");
    println!("  rclonepool upload <file> /path/on/pool");
    println!("  rclonepool serve");
    Ok(EXIT_OK)
}

async fn open_pool(config: Config) -> Result<Arc<Pool>, PoolError> {
    let transport = Arc::new(RcloneTransport::new(&config));
    Ok(Arc::new(Pool::new(config, transport).await?))
}

/// Print a one-line failure and map it to the exit code contract.
fn report(err: PoolError) -> i32 {
    eprintln!("error: {err}");
    if err.is_not_found() {
        EXIT_NOT_FOUND
    } else {
        EXIT_FAILURE
    }
}
