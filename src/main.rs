use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::{Parser, Subcommand};
use futures::{StreamExt, TryStreamExt};
use objectdrive::{
    adapters::{local, DEFAULT_SIGNED_URL_EXPIRY},
    util::stream::{read_chunks, READ_CHUNK_SIZE},
    ByteStream, ConfigError, Content, SignedUrlOptions, Storage, StorageConfig, StorageError,
    StorageManager,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, span, Instrument, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "objectdrive", version, about = "Move files in and out of configured disks")]
struct Cli {
    /// TOML file describing the disks.
    #[arg(short, long, default_value = "objectdrive.toml")]
    config: PathBuf,

    /// Disk to act on; the configured default when omitted.
    #[arg(short, long)]
    disk: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print whether an object exists.
    Exists { location: String },
    /// Write an object to stdout.
    Cat { location: String },
    /// Upload a local file, or stdin with `-`.
    Put { location: String, source: String },
    Cp { src: String, dest: String },
    Mv { src: String, dest: String },
    Rm { location: String },
    Stat { location: String },
    /// List every object under a prefix.
    Ls {
        #[arg(default_value = "")]
        prefix: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print the public url of an object.
    Url { location: String },
    /// Print a signed read url.
    Sign {
        location: String,
        /// Lifetime in seconds.
        #[arg(short, long, default_value_t = DEFAULT_SIGNED_URL_EXPIRY.as_secs())]
        expiry: u64,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let span = span!(Level::INFO, "main", context = "main");
    info!(parent: &span, config = %cli.config.display(), disk = ?cli.disk, "called");

    match run(cli).instrument(span).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error_message = %err, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let manager = StorageManager::new(StorageConfig::from_file(&cli.config)?);
    let disk = match &cli.disk {
        Some(name) => manager.disk(name).await?,
        None => manager.default_disk().await?,
    };

    match cli.command {
        Command::Exists { location } => {
            println!("{}", disk.exists(&location).await?.exists);
        }
        Command::Cat { location } => {
            let mut body = disk.get_stream(&location);
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = body.try_next().await? {
                stdout.write_all(&chunk).await?;
            }
            stdout.flush().await?;
        }
        Command::Put { location, source } => {
            let body: ByteStream = if source == "-" {
                Box::pin(
                    read_chunks(tokio::io::stdin(), READ_CHUNK_SIZE)
                        .map_err(|err| local::translate(err, "-")),
                )
            } else {
                let file = tokio::fs::File::open(&source).await?;
                Box::pin(
                    read_chunks(file, READ_CHUNK_SIZE)
                        .map_err(move |err| local::translate(err, &source)),
                )
            };

            disk.put(&location, Content::Stream(body)).await?;
            info!(location = %location, "uploaded");
        }
        Command::Cp { src, dest } => {
            disk.copy(&src, &dest).await?;
        }
        Command::Mv { src, dest } => {
            disk.move_file(&src, &dest).await?;
        }
        Command::Rm { location } => {
            let outcome = match disk.delete(&location).await?.was_deleted {
                Some(true) => "deleted",
                Some(false) => "not found",
                None => "delete sent",
            };
            println!("{}", outcome);
        }
        Command::Stat { location } => {
            let stat = disk.get_stat(&location).await?;
            println!("size={} modified={}", stat.size, stat.modified);
        }
        Command::Ls { prefix, limit } => {
            let mut entries = disk.flat_list(&prefix);
            if let Some(limit) = limit {
                entries = Box::pin(entries.take(limit));
            }

            while let Some(entry) = entries.try_next().await? {
                println!("{}", entry.path);
            }
        }
        Command::Url { location } => {
            println!("{}", disk.get_url(&location)?);
        }
        Command::Sign { location, expiry } => {
            let options = SignedUrlOptions::expires_in(Duration::from_secs(expiry));
            println!("{}", disk.get_signed_url(&location, options).await?.signed_url);
        }
    }

    Ok(())
}
