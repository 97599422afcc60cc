//! Command-line runner for device-fingerprinting scripts.
//!
//! Loads the script, runs it inside the emulated browser host and prints the
//! device id it produces on stdout. Diagnostics go to stderr.
//!
//! # Examples
//!
//! ```bash
//! # Desktop profile with defaults
//! devid sm.js
//!
//! # Mobile profile, longer deadline
//! SMSDK_USER_AGENT="Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X)" \
//!   devid sm.js --timeout-ms 30000
//!
//! # Custom service record and accessor
//! devid sm.js --service-config smconf.json --accessor SMSdk.getDeviceId -v
//! ```
//!
//! Exit status is `0` on success, `2` when no id appeared before the
//! deadline and `1` for every other failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use devid::{NetworkConfig, ProfileInputs, Sandbox, ServiceConfig};
use tracing_subscriber::EnvFilter;

/// Run a fingerprinting script and print its device id.
#[derive(Parser, Debug)]
#[command(name = "devid")]
#[command(version, about, long_about = None)]
struct Args {
    /// Script to execute
    #[arg(required = true)]
    script: PathBuf,

    /// Browser identity string (navigator.userAgent)
    #[arg(long, env = "SMSDK_USER_AGENT")]
    user_agent: Option<String>,

    /// Accept-language list, e.g. "zh-CN,zh;q=0.9"
    #[arg(long, env = "SMSDK_ACCEPT_LANGUAGE")]
    accept_language: Option<String>,

    /// Page URL the script believes it runs on
    #[arg(long, env = "SMSDK_REFERER")]
    referer: Option<String>,

    /// navigator.platform override
    #[arg(long, env = "SMSDK_PLATFORM")]
    platform: Option<String>,

    /// Overall deadline in milliseconds
    #[arg(long, env = "SMSDK_TIMEOUT_MS", default_value_t = 15_000)]
    timeout_ms: u64,

    /// Delay between probes of the completion accessor, in milliseconds
    #[arg(long, env = "SMSDK_POLL_INTERVAL_MS", default_value_t = 200)]
    poll_interval_ms: u64,

    /// Dotted path of the completion accessor
    #[arg(long, env = "SMSDK_ACCESSOR", default_value = devid::DEFAULT_ACCESSOR)]
    accessor: String,

    /// JSON file replacing the `_smConf` service record
    #[arg(long, env = "SMSDK_SERVICE_CONFIG")]
    service_config: Option<PathBuf>,

    /// Hosts the script may contact (supports `*.domain` patterns).
    /// Can be specified multiple times; all hosts are allowed by default.
    #[arg(long = "allow-host", env = "SMSDK_ALLOWED_HOSTS", value_delimiter = ',')]
    allowed_hosts: Vec<String>,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "SMSDK_REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    request_timeout_ms: u64,

    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Usage errors share exit status 1 with every other non-timeout failure.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return if err.exit_code() == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
    };

    let default_filter = match args.verbose {
        0 => "devid=warn",
        1 => "devid=debug",
        _ => "devid=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(args.verbose > 0)
        .init();

    match run(args).await {
        Ok(id) => {
            println!("{id}");
            ExitCode::SUCCESS
        }
        Err(err) => report(&err),
    }
}

async fn run(args: Args) -> Result<String> {
    let service = match &args.service_config {
        Some(path) => ServiceConfig::from_json_file(path)
            .with_context(|| format!("Failed to load service config: {}", path.display()))?,
        None => ServiceConfig::default(),
    };

    let mut network = NetworkConfig::builder().timeout(Duration::from_millis(args.request_timeout_ms));
    if !args.allowed_hosts.is_empty() {
        network = network.allowed_hosts(args.allowed_hosts);
    }

    let sandbox = Sandbox::builder()
        .with_profile_inputs(ProfileInputs {
            user_agent: args.user_agent,
            accept_language: args.accept_language,
            referer: args.referer,
            platform: args.platform,
        })
        .with_service(service)
        .with_network(network.build())
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms))
        .with_accessor(args.accessor)
        .build();

    tracing::debug!(script = %args.script.display(), "starting run");
    Ok(sandbox.run_file(&args.script).await?)
}

fn report(err: &anyhow::Error) -> ExitCode {
    eprintln!("error: {err:#}");
    match err.downcast_ref::<devid::Error>() {
        Some(err) => {
            if let Some(trace) = err.trace() {
                eprintln!("{trace}");
            }
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
        }
        None => ExitCode::FAILURE,
    }
}
