use std::io::{Read, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const DELETE_TOKEN_HEADER: &str = "x-delete-token";

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "hush", about = "hush: share a secret that burns after reading", version)]
struct Cli {
    /// Hush server URL (default: http://localhost:8080 or $HUSH_SERVER)
    #[arg(long, env = "HUSH_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Bearer token for create and prune ($HUSH_TOKEN)
    #[arg(long, env = "HUSH_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hush HTTP server
    Serve {
        /// Port to listen on (default: $HUSH_PORT or 8080)
        #[arg(long, env = "HUSH_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $HUSH_HOST or 0.0.0.0)
        #[arg(long, env = "HUSH_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Store a secret read from --value or stdin
    Create {
        /// Secret value; read from stdin when omitted
        #[arg(long)]
        value: Option<String>,
        /// TTL duration e.g. 1h, 30m, 7d
        #[arg(long)]
        ttl: Option<String>,
        /// Number of reads before the secret is destroyed
        #[arg(long)]
        reads: Option<u32>,
        /// Content type stored with the secret
        #[arg(long, default_value = "text/plain")]
        content_type: String,
    },
    /// Read (and consume) a secret
    Read {
        id: String,
        /// Hex access key
        key: String,
    },
    /// Show a secret's remaining reads and expiry without consuming it
    Status { id: String },
    /// Issue an additional access key from an existing one
    Mint {
        id: String,
        /// An existing access key
        key: String,
        /// TTL of the new key e.g. 10m
        #[arg(long)]
        ttl: Option<String>,
        /// Reads allowed through the new key
        #[arg(long)]
        reads: Option<u32>,
    },
    /// List a secret's usable keys
    Keys {
        id: String,
        #[arg(long, env = "HUSH_DELETE_TOKEN")]
        delete_token: String,
    },
    /// Revoke one access key
    Revoke {
        id: String,
        key_id: String,
        #[arg(long, env = "HUSH_DELETE_TOKEN")]
        delete_token: String,
    },
    /// Delete a secret and all of its keys
    Delete {
        id: String,
        #[arg(long, env = "HUSH_DELETE_TOKEN")]
        delete_token: String,
    },
    /// Delete all expired secrets immediately
    Prune,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("HUSH_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let api = Api::new(&cli.server, cli.token.clone());

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Create {
            value,
            ttl,
            reads,
            content_type,
        } => cmd_create(&api, value, ttl.as_deref(), reads, &content_type).await,

        Commands::Read { id, key } => cmd_read(&api, &id, &key).await,

        Commands::Status { id } => cmd_status(&api, &id).await,

        Commands::Mint {
            id,
            key,
            ttl,
            reads,
        } => cmd_mint(&api, &id, &key, ttl.as_deref(), reads).await,

        Commands::Keys { id, delete_token } => cmd_keys(&api, &id, &delete_token).await,

        Commands::Revoke {
            id,
            key_id,
            delete_token,
        } => cmd_revoke(&api, &id, &key_id, &delete_token).await,

        Commands::Delete { id, delete_token } => cmd_delete(&api, &id, &delete_token).await,

        Commands::Prune => cmd_prune(&api).await,
    }
}

// ── HTTP client ───────────────────────────────────────────────────────────────

struct Api {
    client: Client,
    base: String,
    token: Option<String>,
}

impl Api {
    fn new(server: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base: server.trim_end_matches('/').to_owned(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

async fn send(req: RequestBuilder) -> Result<Response> {
    let resp = req.send().await.context("HTTP request failed")?;
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();
    anyhow::bail!(
        "server returned {status}: {}",
        json["error"].as_str().unwrap_or("")
    );
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = hush_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    hush_server::run(cfg).await
}

async fn cmd_create(
    api: &Api,
    value: Option<String>,
    ttl: Option<&str>,
    reads: Option<u32>,
    content_type: &str,
) -> Result<()> {
    let body = match value {
        Some(v) => v.into_bytes(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("read secret from stdin")?;
            buf
        }
    };
    if body.is_empty() {
        anyhow::bail!("secret is empty");
    }

    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(ttl) = ttl {
        query.push(("ttl", parse_duration(ttl)?.to_string()));
    }
    if let Some(reads) = reads {
        query.push(("reads", reads.to_string()));
    }

    let req = api
        .authed(api.client.post(api.url("/secrets")))
        .query(&query)
        .header(reqwest::header::CONTENT_TYPE, content_type)
        .body(body);
    let json: Value = send(req).await?.json().await.context("parse response")?;

    let id = json["id"].as_str().unwrap_or_default();
    let key = json["key"].as_str().unwrap_or_default();
    println!("{}", api.url(&format!("/secrets/{id}/{key}")));
    println!("id:           {id}");
    println!("key:          {key}");
    println!(
        "delete token: {}",
        json["delete_token"].as_str().unwrap_or_default()
    );
    println!(
        "reads:        {}",
        json["remaining_reads"].as_i64().unwrap_or_default()
    );
    println!(
        "expires in:   {}",
        expires_in(json["expires_at"].as_i64().unwrap_or_default())
    );
    Ok(())
}

async fn cmd_read(api: &Api, id: &str, key: &str) -> Result<()> {
    let resp = send(api.client.get(api.url(&format!("/secrets/{id}/{key}")))).await?;
    let bytes = resp.bytes().await.context("read response body")?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes).context("write secret")?;
    stdout.flush().context("flush stdout")?;
    Ok(())
}

async fn cmd_status(api: &Api, id: &str) -> Result<()> {
    let resp = send(api.client.head(api.url(&format!("/secrets/{id}")))).await?;
    let header = |name: &str| {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned()
    };
    let expires_at: i64 = header("x-hush-expires-at").parse().unwrap_or_default();
    println!("reads left:   {}", header("x-hush-remaining-reads"));
    println!("expires in:   {}", expires_in(expires_at));
    println!("content type: {}", header("x-hush-content-type"));
    Ok(())
}

async fn cmd_mint(
    api: &Api,
    id: &str,
    key: &str,
    ttl: Option<&str>,
    reads: Option<u32>,
) -> Result<()> {
    let body = serde_json::json!({
        "key": key,
        "ttl_seconds": ttl.map(parse_duration).transpose()?,
        "max_reads": reads,
    });
    let req = api
        .client
        .post(api.url(&format!("/secrets/{id}/keys")))
        .json(&body);
    let json: Value = send(req).await?.json().await.context("parse response")?;

    let new_key = json["key"].as_str().unwrap_or_default();
    println!("{}", api.url(&format!("/secrets/{id}/{new_key}")));
    println!("key id: {}", json["key_id"].as_str().unwrap_or_default());
    Ok(())
}

#[derive(serde::Deserialize)]
struct KeyItem {
    id: String,
    created_at: i64,
    expires_at: Option<i64>,
    remaining_reads: Option<i64>,
}

async fn cmd_keys(api: &Api, id: &str, delete_token: &str) -> Result<()> {
    let req = api
        .client
        .get(api.url(&format!("/secrets/{id}/keys")))
        .header(DELETE_TOKEN_HEADER, delete_token);
    let json: Value = send(req).await?.json().await.context("parse response")?;
    let keys: Vec<KeyItem> =
        serde_json::from_value(json["keys"].clone()).context("parse key list")?;

    if keys.is_empty() {
        println!("(no usable keys)");
        return Ok(());
    }
    for k in &keys {
        let ttl_info = match k.expires_at {
            Some(exp) => format!("expires in {}", expires_in(exp)),
            None => "entry TTL".to_string(),
        };
        let reads_info = match k.remaining_reads {
            Some(n) => format!("{n} reads left"),
            None => "entry reads".to_string(),
        };
        println!("  {} | created {} | {ttl_info} | {reads_info}", k.id, k.created_at);
    }
    Ok(())
}

async fn cmd_revoke(api: &Api, id: &str, key_id: &str, delete_token: &str) -> Result<()> {
    let req = api
        .client
        .delete(api.url(&format!("/secrets/{id}/keys/{key_id}")))
        .header(DELETE_TOKEN_HEADER, delete_token);
    send(req).await?;
    println!("✓ revoked {key_id}");
    Ok(())
}

async fn cmd_delete(api: &Api, id: &str, delete_token: &str) -> Result<()> {
    let req = api
        .client
        .delete(api.url(&format!("/secrets/{id}")))
        .header(DELETE_TOKEN_HEADER, delete_token);
    send(req).await?;
    println!("✓ deleted {id}");
    Ok(())
}

async fn cmd_prune(api: &Api) -> Result<()> {
    let req = api.authed(api.client.post(api.url("/prune")));
    let json: Value = send(req).await?.json().await.context("parse response")?;
    let entries = json["entries"].as_u64().unwrap_or(0);
    let keys = json["keys"].as_u64().unwrap_or(0);
    println!("pruned {entries} secret(s) and {keys} key(s)");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

fn expires_in(expires_at: i64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let secs_left = expires_at - now;
    if secs_left > 0 {
        format_duration(secs_left as u64)
    } else {
        "expired".to_string()
    }
}

fn format_duration(secs: u64) -> String {
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
