//! Command-line client for ferry uploads.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ferry_client::{
    ApiClient, UploadApi, UploadEvent, UploadOutcome, Uploader, UploaderOptions,
};
use ferry_core::UploadId;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Resumable large-file uploads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct ApiArgs {
    /// Server API URL
    #[arg(long, env = "FERRY_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Bearer token
    #[arg(long, env = "FERRY_TOKEN", hide_env_values = true)]
    token: String,
}

#[derive(Args, Clone, Debug)]
struct TransferArgs {
    /// Maximum concurrent chunk uploads
    #[arg(long, default_value_t = 4)]
    parallel: usize,

    /// Requested chunk size in bytes (the server may adjust it)
    #[arg(long)]
    chunk_size: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file in a new session
    Push {
        file: PathBuf,
        #[command(flatten)]
        transfer: TransferArgs,
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Continue an interrupted upload
    Resume {
        upload_id: String,
        file: PathBuf,
        #[command(flatten)]
        transfer: TransferArgs,
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Show a session's state and accepted chunks
    Status {
        upload_id: String,
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Abort a session and release its quota
    Abort {
        upload_id: String,
        #[command(flatten)]
        api: ApiArgs,
    },
    /// List sessions still accepting chunks
    List {
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Show quota usage
    Quota {
        #[command(flatten)]
        api: ApiArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { command } = Cli::parse();

    match command {
        Commands::Push {
            file,
            transfer,
            api,
        } => handle_transfer(&api, &transfer, file, None).await,
        Commands::Resume {
            upload_id,
            file,
            transfer,
            api,
        } => {
            let upload_id = parse_upload_id(&upload_id)?;
            handle_transfer(&api, &transfer, file, Some(upload_id)).await
        }
        Commands::Status { upload_id, api } => handle_status(&api, &upload_id).await,
        Commands::Abort { upload_id, api } => handle_abort(&api, &upload_id).await,
        Commands::List { api } => handle_list(&api).await,
        Commands::Quota { api } => handle_quota(&api).await,
    }
}

fn client(api: &ApiArgs) -> Result<ApiClient> {
    ApiClient::new(&api.server, &api.token).context("failed to create API client")
}

fn parse_upload_id(s: &str) -> Result<UploadId> {
    UploadId::parse(s).with_context(|| format!("invalid upload ID {s:?}"))
}

fn format_time(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| t.to_string())
}

async fn handle_transfer(
    api: &ApiArgs,
    transfer: &TransferArgs,
    file: PathBuf,
    resume: Option<UploadId>,
) -> Result<()> {
    let client: Arc<dyn UploadApi> = Arc::new(client(api)?);
    let options = UploaderOptions {
        parallel: transfer.parallel.max(1),
        chunk_size: transfer.chunk_size,
        ..UploaderOptions::default()
    };
    let uploader = Arc::new(Uploader::new(client, file.clone(), options));
    uploader.subscribe(print_event);

    let mut task = {
        let uploader = uploader.clone();
        tokio::spawn(async move {
            match resume {
                Some(upload_id) => uploader.resume(upload_id).await,
                None => uploader.start().await,
            }
        })
    };

    let outcome = tokio::select! {
        joined = &mut task => joined.context("upload task failed")??,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, cancelling upload...");
            if let Err(e) = uploader.cancel().await {
                eprintln!("  Failed to abort session on server: {e}");
            }
            task.await.context("upload task failed")??
        }
    };

    match outcome {
        UploadOutcome::Completed(response) => {
            println!("Uploaded {}", file.display());
            println!("  Upload ID: {}", response.upload_id);
            println!("  Size: {} bytes", response.total_size);
            println!("  SHA-256: {}", response.file_sha256);
            Ok(())
        }
        UploadOutcome::FileMismatch => anyhow::bail!(
            "{} does not match the session's file; start a new upload with `ferry push`",
            file.display()
        ),
        UploadOutcome::Aborted => anyhow::bail!("upload aborted"),
    }
}

fn print_event(event: &UploadEvent) {
    match event {
        UploadEvent::Status { phase } => eprintln!("[{phase}]"),
        UploadEvent::Progress {
            uploaded_chunks,
            total_chunks,
            bytes_uploaded,
        } => eprintln!("  {uploaded_chunks}/{total_chunks} chunks ({bytes_uploaded} bytes sent)"),
        UploadEvent::Done { upload_id } => eprintln!("  Upload {upload_id} complete"),
        UploadEvent::Error {
            upload_id, message, ..
        } => match upload_id {
            Some(id) => eprintln!(
                "  Upload failed: {message}\n  Resume with: ferry resume {id} <file>"
            ),
            None => eprintln!("  Upload failed: {message}"),
        },
        UploadEvent::FileMismatch {
            upload_id,
            local_size,
            remote_size,
            ..
        } => eprintln!(
            "  Session {upload_id} describes a different file (local {local_size} bytes, remote {remote_size} bytes)"
        ),
        UploadEvent::Aborted { upload_id } => match upload_id {
            Some(id) => eprintln!("  Upload {id} aborted"),
            None => eprintln!("  Upload aborted"),
        },
    }
}

async fn handle_status(api: &ApiArgs, upload_id: &str) -> Result<()> {
    let upload_id = parse_upload_id(upload_id)?;
    let status = client(api)?.status(upload_id).await?;
    println!("Upload:   {}", status.upload_id);
    println!("File:     {}", status.file_name);
    println!("State:    {}", status.state);
    println!("Size:     {} bytes", status.total_size);
    println!("SHA-256:  {}", status.file_sha256);
    println!(
        "Chunks:   {}/{} accepted ({} bytes each)",
        status.accepted_chunks.len(),
        status.total_chunks,
        status.chunk_size
    );
    let missing = status.missing_chunks();
    if status.state.is_active() && !missing.is_empty() {
        println!("Missing:  {}", summarize_indices(&missing));
    }
    println!("Expires:  {}", format_time(status.expires_at));
    Ok(())
}

async fn handle_abort(api: &ApiArgs, upload_id: &str) -> Result<()> {
    let upload_id = parse_upload_id(upload_id)?;
    let response = client(api)?.abort(upload_id).await?;
    println!("Upload {} is {}", response.upload_id, response.state);
    Ok(())
}

async fn handle_list(api: &ApiArgs) -> Result<()> {
    let response = client(api)?.list().await?;
    if response.uploads.is_empty() {
        println!("No uploads in progress");
        return Ok(());
    }
    for upload in response.uploads {
        println!(
            "{}  {}/{} chunks  {} bytes  expires {}  {}",
            upload.upload_id,
            upload.accepted_chunks,
            upload.total_chunks,
            upload.total_size,
            format_time(upload.expires_at),
            upload.file_name
        );
    }
    Ok(())
}

async fn handle_quota(api: &ApiArgs) -> Result<()> {
    let quota = client(api)?.quota().await?;
    println!("Owner:     {}", quota.owner);
    println!("Limit:     {} bytes", quota.limit);
    println!("Reserved:  {} bytes", quota.reserved);
    println!("Used:      {} bytes", quota.used);
    println!(
        "Available: {} bytes",
        quota.limit.saturating_sub(quota.reserved + quota.used)
    );
    Ok(())
}

/// Collapse sorted indices into ranges: `[0, 1, 2, 5]` becomes `0-2, 5`.
fn summarize_indices(indices: &[u64]) -> String {
    let mut parts = Vec::new();
    let mut iter = indices.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(", ")
}
