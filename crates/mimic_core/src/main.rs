use anyhow::{Context, Result};
use clap::Parser;
use hyper::{Body, Request};
use mimic_core::{FingerprintPolicy, Transport, TransportConfig, TrustPolicy};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Fetch one URL with a browser TLS fingerprint.
#[derive(Parser, Debug)]
#[command(name = "mimic", version)]
struct Cli {
    /// JSON transport config; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    ja3: Option<String>,

    #[arg(long)]
    user_agent: Option<String>,

    /// http://[user:pass@]host[:port]
    #[arg(long)]
    proxy: Option<String>,

    /// Accept any server certificate
    #[arg(long)]
    insecure: bool,

    /// Abort instead of sending a hello whose JA3 differs from the requested one
    #[arg(long)]
    strict_fingerprint: bool,

    /// Write logs to a daily rolling file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_file.as_deref());

    let mut config = match &cli.config {
        Some(path) => TransportConfig::from_file(path)?,
        None => TransportConfig::default(),
    };
    if let Some(ja3) = cli.ja3 {
        config.ja3 = ja3;
    }
    if let Some(user_agent) = cli.user_agent {
        config.user_agent = user_agent;
    }
    if cli.proxy.is_some() {
        config.proxy = cli.proxy;
    }
    if cli.insecure {
        config.trust = TrustPolicy::AcceptInvalid;
    }
    if cli.strict_fingerprint {
        config.fingerprint = FingerprintPolicy::Strict;
    }

    let transport = Transport::from_config(&config)?;
    let request = Request::get(cli.url.as_str())
        .header(hyper::header::USER_AGENT, config.user_agent.as_str())
        .body(Body::empty())
        .context("building request")?;

    let response = transport
        .round_trip(request)
        .await
        .with_context(|| format!("GET {}", cli.url))?;
    println!("{:?} {}", response.version(), response.status());
    let body = hyper::body::to_bytes(response.into_body())
        .await
        .context("reading body")?;
    println!("{}", String::from_utf8_lossy(&body));
    Ok(())
}

/// Stderr by default. With a log file, writes go through a non-blocking appender whose
/// guard must outlive `main`.
fn init_logging(
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let name = path.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "mimic.log".into());
            let appender = tracing_appender::rolling::daily(dir.unwrap_or(std::path::Path::new(".")), name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}
