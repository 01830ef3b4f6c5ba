use std::{
    collections::BTreeMap,
    env,
    fmt,
    fs::File,
    io::{self, stderr},
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, Level, log_enabled};
use serde::{Deserialize, Serialize};
use tokio::{signal::ctrl_c, task};
use tokio_util::sync::CancellationToken;

use progresslib::{ProgressReceiver, ProgressRenderer, RenderMode};
use samfetchlib::{
    acquire::{AcquirePath, AcquireRequest, AcquisitionOrchestrator, Outcome},
    auth::FusSigner,
    crypto::FusKeys,
    probe::{HttpProber, ProbeTable},
    rewrite::ModelRewriter,
};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Interval between progress updates on the terminal
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Load FUS keys from the following list in order:
/// * User-supplied command line arguments
/// * Environment variables
/// * Config file
fn load_keys(opts: &Opts, config: &Option<Config>) -> Result<FusKeys> {
    let fixed_key = opts.fus_fixed_key
        .as_ref()
        .or_else(|| config.as_ref().and_then(|c| c.fus_fixed_key.as_ref()))
        .ok_or_else(|| anyhow!("No FUS fixed key argument or variable specified"))?
        .as_bytes();
    let flexible_key_suffix = opts.fus_flexible_key_suffix
        .as_ref()
        .or_else(|| config.as_ref().and_then(|c| c.fus_flexible_key_suffix.as_ref()))
        .ok_or_else(|| anyhow!("No FUS flexible key suffix argument or variable specified"))?
        .as_bytes();

    Ok(FusKeys::new(fixed_key, flexible_key_suffix)?)
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Trace => f.write_str("trace"),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct Config {
    fus_fixed_key: Option<String>,
    fus_flexible_key_suffix: Option<String>,
    /// Extra model number aliases, applied before the built-in ones
    model_aliases: BTreeMap<String, String>,
    /// Replaces the built-in mirror tables
    probe: Option<ProbeTable>,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push(format!("{PKG_NAME}.conf"));
        p
    })
}

fn load_config_file(user_path: Option<&Path>) -> Result<Option<Config>> {
    let default_path = default_config_path();
    let path = user_path.or(default_path.as_deref());

    match path {
        Some(p) => {
            let file = match File::open(p) {
                Ok(f) => f,
                Err(e) => {
                    return if e.kind() == io::ErrorKind::NotFound {
                        Ok(None)
                    } else {
                        Err(e).context(format!("Could not open file: {p:?}"))
                    };
                }
            };

            let config = serde_json::from_reader(file)
                .context(format!("Could not parse config file: {p:?}"))?;

            Ok(Some(config))
        }
        None => Ok(None),
    }
}

/// Draw progress events until every sender is gone.
async fn render_progress(mut rx: ProgressReceiver) -> Result<()> {
    let mut renderer = ProgressRenderer::new(stderr());
    if log_enabled!(Level::Debug) {
        // The escape sequences for the interactive progress bar would clobber
        // log messages.
        renderer.set_mode(RenderMode::Append);
    }

    while let Some(event) = rx.recv().await {
        task::block_in_place(|| renderer.draw(&event))?;
    }

    renderer.finish()?;

    Ok(())
}

fn print_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Extracted { model, version, metadata, output_dir, entries, bytes_transferred } => {
            println!("Firmware info:");
            println!("- Model: {} ({})", model.original, model.transformed);
            println!("- Version: {version}");
            if !metadata.os_version.is_empty() {
                println!("- OS: {}", metadata.os_version);
            }
            println!("- File: {}{}", metadata.model_path, metadata.filename);
            println!("- Size: {} bytes", metadata.byte_size);
            println!("- Downloaded: {bytes_transferred} bytes");
            println!("Extracted to {output_dir:?}:");
            for entry in entries {
                println!("- {}", entry.display());
            }
        }
        Outcome::Mirrored { model, version, source_url, local_file, upload, summary_file, bytes_transferred } => {
            println!("Firmware info:");
            println!("- Model: {} ({})", model.original, model.transformed);
            println!("- Version: {version}");
            println!("- Source: {source_url}");
            println!("- Downloaded: {bytes_transferred} bytes to {local_file:?}");
            println!("Mirror:");
            println!("- Download page: {}", upload.download_page);
            if let Some(link) = &upload.direct_link {
                println!("- Direct link: {link}");
            }
            println!("- File: {} ({} bytes)", upload.file_name, upload.file_size);
            println!("- Upload time: {:.1}s", upload.upload_time.as_secs_f64());
            println!("- Summary: {summary_file:?}");
        }
    }
}

/// A tool for fetching the latest official firmware of a device, either from
/// the distribution service or from a public mirror.
#[derive(Debug, Parser)]
#[command(author, version)]
struct Opts {
    /// Device's model number (eg. SM-F916N)
    #[arg(short, long)]
    model: String,
    /// Region/CSC code (eg. KOO)
    #[arg(short, long)]
    region: String,
    /// Fetch from a public mirror instead of the distribution service
    ///
    /// The firmware is downloaded as-is from the first mirror that has it and
    /// then uploaded to a file host. The FUS keys are not needed. There is no
    /// fallback between the two modes.
    #[arg(long)]
    bypass: bool,
    /// Parent directory for output
    ///
    /// Files are written to "<model>_<region>" inside this directory.
    #[arg(short, long, value_parser, default_value = ".")]
    output: PathBuf,
    /// Set logging verbosity
    ///
    /// By default, no log messages are printed out. If set to 'debug', the
    /// protocol steps and URLs are printed out. If set to 'trace', I/O read
    /// and write messages are also printed out, which can be extremely verbose.
    /// This option overrides the RUST_LOG environment variable, which would
    /// otherwise be respected if this option was not passed.
    #[arg(value_enum, long)]
    loglevel: Option<LogLevel>,
    /// Ignore TLS validation for HTTPS connections
    ///
    /// By default, all HTTPS connections will validate the TLS certificate
    /// against the system's CA trust store.
    #[arg(long)]
    ignore_tls_validation: bool,
    /// FUS fixed key
    ///
    /// If unspecified, the key is loaded from the `FUS_FIXED_KEY` environment
    /// variable, followed by the `fus_fixed_key` config file variable.
    #[arg(long, env = "FUS_FIXED_KEY")]
    fus_fixed_key: Option<String>,
    /// FUS flexible key suffix
    ///
    /// If unspecified, the key is loaded from the `FUS_FLEXIBLE_KEY_SUFFIX`
    /// environment variable, followed by the `fus_flexible_key_suffix` config
    /// file variable.
    #[arg(long, env = "FUS_FLEXIBLE_KEY_SUFFIX")]
    fus_flexible_key_suffix: Option<String>,
    /// Config file path
    ///
    /// If unspecified, the default config file path is used. The config file
    /// can store the FUS keys, model aliases and mirror tables.
    #[arg(long, value_parser)]
    config: Option<PathBuf>,
}

async fn run(opts: Opts) -> Result<ExitCode> {
    let log_keys_var = format!("{}_LOG_KEYS", PKG_NAME.to_uppercase());
    let log_keys = matches!(env::var(log_keys_var), Ok(v) if v == "true");

    if log_keys {
        debug!("Arguments: {opts:#?}");
    } else {
        debug!("Model: {:?}, region: {:?}, bypass: {}", opts.model, opts.region, opts.bypass);
    }

    let config = load_config_file(opts.config.as_deref())?;
    if log_keys {
        debug!("Config: {config:#?}");
    }

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(opts.ignore_tls_validation)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("Could not initialize HTTP client")?;

    let (progress_tx, progress_rx) = progresslib::channel();
    let renderer = tokio::spawn(render_progress(progress_rx));

    let mut rewriter = ModelRewriter::new();
    let mut probe_table = ProbeTable::default();
    if let Some(c) = &config {
        rewriter = rewriter.with_aliases(c.model_aliases.iter());
        if let Some(t) = &c.probe {
            probe_table = t.clone();
        }
    }

    let orchestrator = AcquisitionOrchestrator::new(client.clone(), HttpProber::new(client))
        .with_rewriter(rewriter)
        .with_probe_table(probe_table)
        .with_progress(progress_tx, PROGRESS_INTERVAL);

    let path = if opts.bypass {
        AcquirePath::Bypass
    } else {
        let keys = load_keys(&opts, &config)?;
        if log_keys {
            debug!("Keys: {keys:?}");
        }

        AcquirePath::Authenticated(FusSigner::new(keys))
    };

    let request = AcquireRequest {
        model: opts.model.clone(),
        region: opts.region.clone(),
        output_dir: opts.output.clone(),
    };

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if ctrl_c().await.is_ok() {
                debug!("Interrupted by user");
                cancel.cancel();
            }
        })
    };

    let result = orchestrator.acquire(&request, path, &cancel).await;
    watcher.abort();

    // Closes the progress channel
    drop(orchestrator);
    renderer.await.context("Unexpected panic in progress renderer")??;

    match result {
        Ok(outcome) => {
            debug!("Outcome: {outcome:#?}");
            print_outcome(&outcome);

            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            let kind = failure.kind();
            let bytes_transferred = failure.bytes_transferred;

            eprintln!("{:?}", anyhow::Error::new(failure.error).context("Acquisition failed"));
            eprintln!("Error kind: {kind}");
            eprintln!("Bytes transferred: {bytes_transferred}");

            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let opts = Opts::parse();

    if let Some(l) = opts.loglevel {
        env::set_var("RUST_LOG", format!("{PKG_NAME}={l},samfetchlib={l},progresslib={l}"));
    }

    env_logger::init();

    run(opts).await
}
