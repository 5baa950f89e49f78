use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use drive_mirror::config::MirrorConfig;
use drive_mirror::inventory::{self, CopyStatus, DuplicateIndex};
use drive_mirror::logging;
use drive_mirror::mirror::{DriveSource, mirror_tree};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "drive-mirror", version, about = "Mirror and inspect a remote Drive tree")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Command {
    /// Download a folder tree and verify every file against its remote checksum
    Mirror {
        /// Remote folder id to start from
        #[arg(default_value = "root")]
        folder_id: String,
        /// Local destination directory (overrides DRIVE_MIRROR_DEST)
        #[arg(short, long)]
        dest: Option<PathBuf>,
        /// Maximum concurrent downloads (overrides DRIVE_MIRROR_CONCURRENCY)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },
    /// Print files matching a query, optionally deleting them
    List {
        /// Query string passed through to the remote API
        query: Option<String>,
        #[arg(long)]
        max_results: Option<usize>,
        /// Ask for confirmation and delete every listed file
        #[arg(long)]
        delete: bool,
    },
    /// Group all files by checksum and write the groups as JSON
    Dedup {
        #[arg(short, long, default_value = "md5dedup.json")]
        output: PathBuf,
    },
    /// Copy listed files into a folder, skipping ones copied by an earlier run
    Copy {
        /// JSON array of file ids to copy
        #[arg(long, default_value = "files_to_copy.json")]
        ids: PathBuf,
        /// Newline-appended JSON record of copies already made
        #[arg(long, default_value = "drive_copy_status.json")]
        status: PathBuf,
        /// Destination folder id; asked for on stdin when omitted
        #[arg(long)]
        parent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = MirrorConfig::from_env()?;
    logging::init(config.log_file.as_deref())?;

    match cli.command {
        Command::Mirror {
            folder_id,
            dest,
            concurrency,
        } => {
            if let Some(dest) = dest {
                config.dest = dest;
            }
            if let Some(concurrency) = concurrency.filter(|value| *value > 0) {
                config.concurrency = concurrency;
            }
            let source = DriveSource::new(config.credentials());
            let report = mirror_tree(source, &folder_id, &config.dest, config.mirror_options())
                .await
                .with_context(|| format!("mirror of {folder_id} into {} aborted", config.dest.display()))?;
            let counts = report.counts();
            if counts.checksum_mismatch + counts.size_mismatch + counts.failed > 0 {
                info!("some files did not verify; see the log for details");
            }
        }
        Command::List {
            query,
            max_results,
            delete,
        } => {
            let source = DriveSource::new(config.credentials());
            let files =
                inventory::collect_files(source.client(), query.as_deref(), max_results).await?;
            for file in &files {
                println!("{}", inventory::describe(file));
            }
            println!("{} files found.", files.len());
            if delete && !files.is_empty() {
                let first = prompt("Delete? ").await?;
                let second = prompt("Are you sure? [Y/n] ").await?;
                if inventory::confirms_delete(&first, &second) {
                    let summary = inventory::delete_files(source.client(), &files).await;
                    println!("{} deleted, {} failed.", summary.deleted, summary.failed);
                } else {
                    println!("Nothing deleted.");
                }
            }
        }
        Command::Dedup { output } => {
            let source = DriveSource::new(config.credentials());
            let index: DuplicateIndex = inventory::scan_duplicates(source.client()).await?;
            for (md5, files) in index.duplicate_groups() {
                let ids: Vec<&str> = files.iter().map(|f| f.id.as_str()).collect();
                println!("{md5}: {}", ids.join(" "));
            }
            println!("{} total files checked for MD5.", index.files_with_md5());
            index.write_json(&output)?;
            info!(path = %output.display(), "duplicate report written");
        }
        Command::Copy {
            ids,
            status,
            parent,
        } => {
            let to_copy = inventory::read_copy_list(&ids)?;
            info!(files = to_copy.len(), "attempting to copy files");
            let mut copies = CopyStatus::load(&status)?;
            let parent = match parent {
                Some(parent) => parent,
                None => prompt("Enter root Drive ID: ").await?.trim().to_string(),
            };
            let parent = if parent.is_empty() { "root".to_string() } else { parent };
            info!(parent = %parent, "using parent folder for copies");

            let source = DriveSource::new(config.credentials());
            let summary = inventory::copy_files(source.client(), &to_copy, &parent, &mut copies).await;
            copies.append_to(&status)?;
            println!(
                "{} copied, {} already copied, {} verified, {} mismatched, {} not verifiable, {} failed.",
                summary.copied,
                summary.reused,
                summary.verified,
                summary.mismatched,
                summary.not_verifiable,
                summary.failed
            );
        }
    }
    Ok(())
}

async fn prompt(question: &str) -> anyhow::Result<String> {
    eprint!("{question}");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read confirmation")?;
    Ok(line)
}
