//! lockbox: encrypted file vault CLI
//!
//! Commands:
//!   config show                          - display current configuration
//!   user add <login>                     - enroll a user (prints the new user id)
//!   put --user <id> <path> [--name <n>]  - encrypt and store a file
//!   get --user <id> <file-id> [<out>]    - fetch and decrypt a file
//!   ls --user <id>                       - list a user's files
//!   rm --user <id> <file-id>             - delete a file

mod setup;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use lockbox_core::config::LockboxConfig;
use lockbox_core::{ClientError, FileId, LockboxError, UserId};
use lockbox_transfer::Transfer;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use setup::LogFormat;

/// Plaintext bytes read from disk per upload chunk
const PUT_CHUNK_SIZE: usize = 64 * 1024;

// ── CLI structure ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "lockbox",
    version,
    about = "Encrypted file vault",
    long_about = "lockbox: store files encrypted under per-user keys on local disk or S3"
)]
struct Cli {
    /// Path to lockbox.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "LOCKBOX_CONFIG",
        default_value = "~/.config/lockbox/lockbox.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log].level
    #[arg(long, env = "LOCKBOX_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides [log].format
    #[arg(long, env = "LOCKBOX_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// User management
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Encrypt a local file and store it
    Put {
        /// Owner of the new file
        #[arg(long, short = 'u', env = "LOCKBOX_USER")]
        user: UserId,

        /// Local file to upload
        path: PathBuf,

        /// Stored file name (default: the local file name)
        #[arg(long, short = 'n')]
        name: Option<String>,
    },

    /// Fetch and decrypt a stored file
    Get {
        #[arg(long, short = 'u', env = "LOCKBOX_USER")]
        user: UserId,

        file_id: FileId,

        /// Output path (default: the stored file name in the current directory)
        out: Option<PathBuf>,
    },

    /// List stored files
    Ls {
        #[arg(long, short = 'u', env = "LOCKBOX_USER")]
        user: UserId,
    },

    /// Delete a stored file
    Rm {
        #[arg(long, short = 'u', env = "LOCKBOX_USER")]
        user: UserId,

        file_id: FileId,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Show the current configuration
    Show,
}

#[derive(Subcommand, Debug)]
enum UserAction {
    /// Enroll a new user with a fresh data key
    Add { login: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = setup::expand_tilde(&cli.config);
    let (config, found) = setup::load_config(&config_path).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = match cli.log_format.clone() {
        Some(format) => format,
        None if config.log.format.eq_ignore_ascii_case("json") => LogFormat::Json,
        None => LogFormat::Text,
    };
    setup::init_logging(&level, &format);

    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    }

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, found),
        Commands::User {
            action: UserAction::Add { login },
        } => {
            let transfer = setup::open_transfer(&config).await?;
            cmd_user_add(&transfer, &login).await
        }
        Commands::Put { user, path, name } => {
            let transfer = setup::open_transfer(&config).await?;
            cmd_put(&transfer, user, &path, name.as_deref()).await
        }
        Commands::Get { user, file_id, out } => {
            let transfer = setup::open_transfer(&config).await?;
            cmd_get(&transfer, user, file_id, out.as_deref()).await
        }
        Commands::Ls { user } => {
            let transfer = setup::open_transfer(&config).await?;
            cmd_ls(&transfer, user).await
        }
        Commands::Rm { user, file_id } => {
            let transfer = setup::open_transfer(&config).await?;
            cmd_rm(&transfer, user, file_id).await
        }
    }
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) =
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Token that fires on Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling transfer");
            trigger.cancel();
        }
    });
    token
}

// ── `lockbox config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &LockboxConfig, config_path: &Path, found: bool) -> Result<()> {
    if found {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `lockbox user add` ────────────────────────────────────────────────────────

async fn cmd_user_add(transfer: &Transfer, login: &str) -> Result<()> {
    let record = transfer
        .vault()
        .enroll(UserId::new_random(), login)
        .await
        .with_context(|| format!("enrolling {login}"))?;
    println!("{}", record.id);
    Ok(())
}

// ── `lockbox put` ─────────────────────────────────────────────────────────────

async fn cmd_put(transfer: &Transfer, user: UserId, path: &Path, name: Option<&str>) -> Result<()> {
    let file_name = match name {
        Some(name) => name.to_string(),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("cannot derive a file name from {}", path.display()))?,
    };

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let total = file.metadata().await?.len();

    let pb = make_progress_bar(total, "put");
    pb.set_message(file_name.clone());
    let progress = pb.clone();
    let chunks = ReaderStream::with_capacity(file, PUT_CHUNK_SIZE)
        .inspect_ok(move |chunk| progress.inc(chunk.len() as u64));

    let meta = transfer
        .upload_stream(user, &file_name, chunks, ctrl_c_token())
        .await
        .with_context(|| format!("uploading {}", path.display()));
    let meta = match meta {
        Ok(meta) => meta,
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(e);
        }
    };
    pb.finish_with_message("done");

    println!("  id:      {}", meta.id);
    println!("  name:    {}", meta.file_name);
    println!("  bytes:   {}", fmt_bytes(meta.file_size));
    println!("  stored:  {}", fmt_bytes(meta.blob_size));
    Ok(())
}

// ── `lockbox get` ─────────────────────────────────────────────────────────────

async fn cmd_get(transfer: &Transfer, user: UserId, file_id: FileId, out: Option<&Path>) -> Result<()> {
    let mut download = transfer
        .start_download(&file_id, &user)
        .await
        .map_err(|e| client_facing(e, &file_id))?;
    let meta = download.metadata().clone();

    let out = match out {
        Some(out) => out.to_path_buf(),
        // only the final component of the stored name is trusted as a path
        None => Path::new(&meta.file_name)
            .file_name()
            .map(PathBuf::from)
            .with_context(|| format!("stored name {:?} is not a file name", meta.file_name))?,
    };
    let tmp = part_path(&out);

    let pb = make_progress_bar(meta.file_size, "get");
    pb.set_message(meta.file_name.clone());

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("creating {}", tmp.display()))?;
    let written: Result<()> = async {
        while let Some(chunk) = download.next_chunk().await? {
            file.write_all(&chunk).await?;
            pb.inc(chunk.len() as u64);
        }
        file.sync_all().await?;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if let Err(e) = written {
        pb.abandon_with_message("failed");
        drop(file);
        if let Err(rm) = tokio::fs::remove_file(&tmp).await {
            warn!(path = %tmp.display(), error = %rm, "failed to remove partial download");
        }
        return Err(e.context(format!("downloading {file_id}")));
    }

    tokio::fs::rename(&tmp, &out)
        .await
        .with_context(|| format!("moving download into {}", out.display()))?;
    pb.finish_with_message("done");
    info!(file_id = %file_id, path = %out.display(), bytes = meta.file_size, "file written");

    println!("  wrote:   {} ({})", out.display(), fmt_bytes(meta.file_size));
    Ok(())
}

/// Sibling path used while a download is in flight
fn part_path(out: &Path) -> PathBuf {
    let name = out
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    out.with_file_name(format!(".{name}.part"))
}

// ── `lockbox ls` / `lockbox rm` ───────────────────────────────────────────────

async fn cmd_ls(transfer: &Transfer, user: UserId) -> Result<()> {
    let files = transfer.list_files(&user).await?;
    if files.is_empty() {
        println!("no files");
        return Ok(());
    }

    println!("{:<36}  {:>10}  {:>12}  NAME", "ID", "SIZE", "CREATED");
    for meta in files {
        println!(
            "{:<36}  {:>10}  {:>12}  {}",
            meta.id,
            fmt_bytes(meta.file_size),
            meta.created_at,
            meta.file_name
        );
    }
    Ok(())
}

async fn cmd_rm(transfer: &Transfer, user: UserId, file_id: FileId) -> Result<()> {
    transfer
        .delete_file(&file_id, &user)
        .await
        .map_err(|e| client_facing(e, &file_id))?;
    println!("deleted {file_id}");
    Ok(())
}

/// Ownership failures read exactly like a missing file.
fn client_facing(e: LockboxError, file_id: &FileId) -> anyhow::Error {
    match e.client_error() {
        ClientError::NotFound => anyhow::anyhow!("{file_id}: {}", ClientError::NotFound),
        _ => e.into(),
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_bytes() {
        assert_eq!(fmt_bytes(0), "0 B");
        assert_eq!(fmt_bytes(1023), "1023 B");
        assert_eq!(fmt_bytes(1536), "1.5 KB");
        assert_eq!(fmt_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_foreign_file_reads_as_missing() {
        let id = FileId::new_random();
        let denied = client_facing(LockboxError::PermissionDenied(format!("file {id}")), &id);
        let missing = client_facing(LockboxError::NotFound(format!("file {id}")), &id);
        assert_eq!(denied.to_string(), missing.to_string());
        assert!(!denied.to_string().contains("permission"));
    }

    #[test]
    fn test_part_path_is_hidden_sibling() {
        assert_eq!(
            part_path(Path::new("/tmp/out/report.pdf")),
            PathBuf::from("/tmp/out/.report.pdf.part")
        );
        assert_eq!(part_path(Path::new("notes")), PathBuf::from(".notes.part"));
    }

    #[test]
    fn test_cli_parses_put() {
        let user = UserId::new_random();
        let cli = Cli::try_parse_from([
            "lockbox",
            "put",
            "--user",
            &user.to_string(),
            "/tmp/file.bin",
            "--name",
            "renamed.bin",
        ])
        .unwrap();
        match cli.command {
            Commands::Put { user: u, path, name } => {
                assert_eq!(u, user);
                assert_eq!(path, PathBuf::from("/tmp/file.bin"));
                assert_eq!(name.as_deref(), Some("renamed.bin"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_file_id() {
        let user = UserId::new_random().to_string();
        assert!(Cli::try_parse_from(["lockbox", "get", "--user", &user, "not-a-uuid"]).is_err());
    }
}
