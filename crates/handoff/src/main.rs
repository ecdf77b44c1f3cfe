use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "handoff", about = "handoff — one-time secret exchange", version)]
struct Cli {
    /// Handoff server URL (default: http://localhost:8080 or $HANDOFF_SERVER)
    #[arg(long, env = "HANDOFF_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Bearer token for revocation ($HANDOFF_TOKEN)
    #[arg(long, env = "HANDOFF_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the handoff HTTP server
    Serve {
        /// Port to listen on (default: $HANDOFF_PORT or 8080)
        #[arg(long, env = "HANDOFF_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $HANDOFF_HOST or 0.0.0.0)
        #[arg(long, env = "HANDOFF_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Store a secret and print its one-time identifier
    Push {
        /// Secret text (omit when using --file)
        text: Option<String>,
        /// Read the secret from a file instead
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
        /// TTL label: 1h, 6h, 12h, 1d, 7d
        #[arg(long, default_value = "1d")]
        ttl: String,
        /// Allow non-destructive previews before the final claim
        #[arg(long)]
        peek: bool,
        /// Preview budget when --peek is set
        #[arg(long, default_value = "1")]
        views: u32,
        /// MIME type to attach to a file secret
        #[arg(long)]
        mimetype: Option<String>,
    },
    /// Claim (retrieve and destroy) a secret by identifier
    Claim {
        id: String,
        /// Write a file payload here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Preview a secret without destroying it
    Peek { id: String },
    /// Destroy an unclaimed secret early
    Revoke { id: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("HANDOFF_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,
        Commands::Push {
            text,
            file,
            ttl,
            peek,
            views,
            mimetype,
        } => cmd_push(&cli.server, text, file, &ttl, peek, views, mimetype).await,
        Commands::Claim { id, out } => cmd_claim(&cli.server, &id, out).await,
        Commands::Peek { id } => cmd_peek(&cli.server, &id).await,
        Commands::Revoke { id } => cmd_revoke(&cli.server, cli.token.as_deref(), &id).await,
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = handoff_server::ServerConfig {
        host,
        port,
        ..handoff_server::ServerConfig::default()
    };
    handoff_server::run(cfg).await
}

#[allow(clippy::too_many_arguments)]
async fn cmd_push(
    server: &str,
    text: Option<String>,
    file: Option<PathBuf>,
    ttl: &str,
    peek: bool,
    views: u32,
    mimetype: Option<String>,
) -> Result<()> {
    let body = match (&text, &file) {
        (Some(t), None) => json!({
            "payload": t,
            "kind": "text",
            "ttl": ttl,
            "peek_allowed": peek,
            "view_limit": views,
        }),
        (None, Some(path)) => {
            let bytes =
                std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned);
            json!({
                "payload": BASE64.encode(&bytes),
                "kind": "file",
                "ttl": ttl,
                "filename": filename,
                "mimetype": mimetype,
                "peek_allowed": peek,
                "view_limit": views,
            })
        }
        _ => bail!("provide either secret text or --file"),
    };

    let resp = Client::new()
        .post(format!("{}/secrets", server.trim_end_matches('/')))
        .json(&body)
        .send()
        .await
        .context("request failed")?;

    let status = resp.status();
    let value: Value = resp.json().await.context("invalid response")?;
    if !status.is_success() {
        bail!("server error ({status}): {}", error_of(&value));
    }

    let id = value["id"].as_str().unwrap_or_default();
    println!("{id}");
    eprintln!(
        "claim url: {}/secrets/{id}",
        server.trim_end_matches('/')
    );
    Ok(())
}

async fn cmd_claim(server: &str, id: &str, out: Option<PathBuf>) -> Result<()> {
    let resp = Client::new()
        .get(format!("{}/secrets/{id}", server.trim_end_matches('/')))
        .send()
        .await
        .context("request failed")?;

    let status = resp.status();
    let value: Value = resp.json().await.context("invalid response")?;
    if !status.is_success() {
        bail!("server error ({status}): {}", error_of(&value));
    }

    print_secret(&value, out)
}

async fn cmd_peek(server: &str, id: &str) -> Result<()> {
    let resp = Client::new()
        .get(format!(
            "{}/secrets/{id}/peek",
            server.trim_end_matches('/')
        ))
        .send()
        .await
        .context("request failed")?;

    let status = resp.status();
    let value: Value = resp.json().await.context("invalid response")?;
    if !status.is_success() {
        bail!("server error ({status}): {}", error_of(&value));
    }

    if let Some(remaining) = value["views_remaining"].as_u64() {
        eprintln!("previews remaining: {remaining}");
    }
    print_secret(&value, None)
}

async fn cmd_revoke(server: &str, token: Option<&str>, id: &str) -> Result<()> {
    let mut req = Client::new().delete(format!("{}/secrets/{id}", server.trim_end_matches('/')));
    if let Some(t) = token {
        req = req.bearer_auth(t);
    }
    let resp = req.send().await.context("request failed")?;

    let status = resp.status();
    let value: Value = resp.json().await.context("invalid response")?;
    if !status.is_success() {
        bail!("server error ({status}): {}", error_of(&value));
    }

    println!("revoked {id}");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn print_secret(value: &Value, out: Option<PathBuf>) -> Result<()> {
    let payload = value["payload"].as_str().unwrap_or_default();
    match value["kind"].as_str() {
        Some("file") => {
            let bytes = BASE64.decode(payload).context("decode file payload")?;
            let path = out.unwrap_or_else(|| {
                PathBuf::from(
                    value["filename"]
                        .as_str()
                        .unwrap_or("handoff.bin")
                        .to_owned(),
                )
            });
            std::fs::write(&path, bytes)
                .with_context(|| format!("write {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        _ => {
            if let Some(path) = out {
                std::fs::write(&path, payload)
                    .with_context(|| format!("write {}", path.display()))?;
                eprintln!("wrote {}", path.display());
            } else {
                println!("{payload}");
            }
        }
    }
    Ok(())
}

fn error_of(value: &Value) -> &str {
    value["error"].as_str().unwrap_or("unknown error")
}
