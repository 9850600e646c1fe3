//! cache-tests CLI
//!
//! Loads suites, validates them, runs them through the cache under test and
//! prints a summary. Exit status: 0 clean, 1 required failures, 2 the corpus
//! or configuration was rejected.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use cache_tests::{
    load_suites, CacheTarget, Harness, HarnessConfig, RealTimePacer, RunMode, SetupTestsPolicy, Timeouts,
};
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use url::Url;

#[derive(Parser)]
#[command(name = "cache-tests")]
#[command(about = "Conformance tests for HTTP caches")]
#[command(version)]
struct Cli {
    /// How requests reach the cache
    #[arg(long, value_enum, default_value = "reverse-proxy")]
    target: TargetKind,

    /// Cache address (host:port); required unless --target direct
    #[arg(long)]
    cache: Option<String>,

    /// Address the origin server binds
    #[arg(long, default_value = "127.0.0.1:8000")]
    origin_bind: String,

    /// Origin URL as the cache reaches it, when it differs from the bind address
    #[arg(long)]
    origin_url: Option<Url>,

    /// Class of cache under test
    #[arg(long, value_enum, default_value = "shared")]
    mode: RunMode,

    /// Pause after `pause_after` steps, in seconds
    #[arg(long, default_value_t = 3)]
    pause: u64,

    /// Maximum number of tests in flight
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// How failures of `setup_tests` fields count
    #[arg(long, value_enum, default_value = "enforce")]
    setup_tests: SetupTestsPolicy,

    /// Connect timeout per request, in seconds; 0 disables it
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Response timeout per request, in seconds; 0 disables it
    #[arg(long, default_value_t = 30)]
    response_timeout: u64,

    /// Write the JSON report here
    #[arg(long)]
    json: Option<PathBuf>,

    /// Run only these tests (plus their dependencies); repeatable
    #[arg(long = "id")]
    ids: Vec<String>,

    /// Suite files
    #[arg(required = true)]
    suites: Vec<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum TargetKind {
    ForwardProxy,
    ReverseProxy,
    Direct,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cache_tests=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("cache-tests: {}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> cache_tests::Result<ExitCode> {
    let target = match (cli.target, cli.cache) {
        (TargetKind::Direct, _) => CacheTarget::Direct,
        (TargetKind::ForwardProxy, Some(proxy)) => CacheTarget::ForwardProxy { proxy },
        (TargetKind::ReverseProxy, Some(cache)) => CacheTarget::ReverseProxy { cache },
        (_, None) => return Err(cache_tests::Error::schema("--cache is required for proxy targets")),
    };

    let mut config = HarnessConfig::new()
        .target(target)
        .origin_bind(cli.origin_bind)
        .mode(cli.mode)
        .pause(Duration::from_secs(cli.pause))
        .concurrency(cli.concurrency)
        .setup_tests_policy(cli.setup_tests)
        .timeouts(timeouts(cli.connect_timeout, cli.response_timeout))
        .only(cli.ids);
    if let Some(url) = cli.origin_url {
        config = config.origin_public(url);
    }

    let suites = load_suites(&cli.suites)?;
    let harness = Harness::new(config, &suites)?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing in-flight tests");
            let _ = cancel_tx.send(true);
        }
    });

    let report = harness.run(Arc::new(RealTimePacer), cancel_rx).await?;
    println!("{}", report);

    if let Some(path) = cli.json {
        std::fs::write(&path, report.to_json()?)?;
        tracing::info!("report written to {}", path.display());
    }

    Ok(if report.has_required_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn timeouts(connect_secs: u64, response_secs: u64) -> Timeouts {
    let timeouts = match connect_secs {
        0 => Timeouts::harness_defaults().no_connect_timeout(),
        secs => Timeouts::harness_defaults().connect(Duration::from_secs(secs)),
    };
    match response_secs {
        0 => timeouts.no_response_timeout(),
        secs => timeouts.response(Duration::from_secs(secs)),
    }
}
