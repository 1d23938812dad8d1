//! cryptfile CLI - encrypt and decrypt files in place.
//!
//! Every file is handed to the request scheduler, which runs one operation
//! at a time and stops draining after a failure unless told otherwise.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

use cryptfile_container::{CryptConfig, CryptoPipeline};
use cryptfile_crypto::{Calibrator, DerivationKind, HmacKind, ProtectedSecret};
use cryptfile_scheduler::{
    Job, PipelineExecutor, QueuePolicy, RequestRecord, RequestScheduler, SchedulerEvent,
    SchedulerStatus,
};

#[derive(Parser)]
#[command(name = "cryptfile")]
#[command(about = "cryptfile - Password-based file encryption")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: <config dir>/cryptfile/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keep processing remaining files after one fails.
    #[arg(long, global = true)]
    resume_on_failure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt files in place.
    Encrypt {
        /// Files to encrypt.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// AES key size in bits: 128, 192 or 256.
        #[arg(long)]
        key_bits: Option<u32>,

        /// Authentication tag algorithm.
        #[arg(long, value_enum)]
        hmac: Option<HmacArg>,

        /// Key derivation function.
        #[arg(long, value_enum)]
        kdf: Option<KdfArg>,

        /// Target key derivation time in milliseconds.
        #[arg(long)]
        target_ms: Option<u64>,

        /// Chunk size in MiB.
        #[arg(long)]
        chunk_mib: Option<usize>,

        /// Encrypt files that already look encrypted.
        #[arg(long)]
        force: bool,
    },

    /// Decrypt files in place.
    Decrypt {
        /// Files to decrypt.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show the header of an encrypted file.
    Inspect {
        /// Encrypted file.
        file: PathBuf,
    },

    /// Measure key derivation speed on this machine.
    Calibrate {
        /// Key derivation function.
        #[arg(long, value_enum)]
        kdf: Option<KdfArg>,

        /// Target key derivation time in milliseconds.
        #[arg(long)]
        target_ms: Option<u64>,
    },

    /// Print the effective configuration.
    Config {
        /// Write it to the configuration file.
        #[arg(long)]
        save: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum HmacArg {
    Sha256,
    Sha384,
    Sha512,
}

impl From<HmacArg> for HmacKind {
    fn from(arg: HmacArg) -> Self {
        match arg {
            HmacArg::Sha256 => HmacKind::Sha256,
            HmacArg::Sha384 => HmacKind::Sha384,
            HmacArg::Sha512 => HmacKind::Sha512,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum KdfArg {
    Pbkdf2,
    Argon2id,
}

impl From<KdfArg> for DerivationKind {
    fn from(arg: KdfArg) -> Self {
        match arg {
            KdfArg::Pbkdf2 => DerivationKind::Pbkdf2Sha256,
            KdfArg::Argon2id => DerivationKind::argon2id_default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.clone().or_else(CryptConfig::default_path);
    let mut config = load_config(config_path.as_deref())?;
    if cli.resume_on_failure {
        config.resume_on_failure = true;
    }

    match cli.command {
        Commands::Encrypt {
            files,
            key_bits,
            hmac,
            kdf,
            target_ms,
            chunk_mib,
            force,
        } => {
            apply_overrides(&mut config, key_bits, hmac, kdf, target_ms, chunk_mib)?;
            cmd_encrypt(&config, files, force).await
        }

        Commands::Decrypt { files } => cmd_decrypt(&config, files).await,

        Commands::Inspect { file } => cmd_inspect(&config, &file),

        Commands::Calibrate { kdf, target_ms } => {
            apply_overrides(&mut config, None, None, kdf, target_ms, None)?;
            cmd_calibrate(&config)
        }

        Commands::Config { save } => cmd_config(&config, config_path.as_deref(), save),
    }
}

/// Load the config file if it exists, defaults otherwise.
fn load_config(path: Option<&Path>) -> Result<CryptConfig> {
    match path {
        Some(path) if path.exists() => CryptConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        _ => Ok(CryptConfig::default()),
    }
}

fn apply_overrides(
    config: &mut CryptConfig,
    key_bits: Option<u32>,
    hmac: Option<HmacArg>,
    kdf: Option<KdfArg>,
    target_ms: Option<u64>,
    chunk_mib: Option<usize>,
) -> Result<()> {
    if let Some(bits) = key_bits {
        config.key_size_bits = bits;
    }
    if let Some(hmac) = hmac {
        config.hmac = Some(hmac.into());
    }
    if let Some(kdf) = kdf {
        config.derivation = kdf.into();
    }
    if let Some(ms) = target_ms {
        config.target_derivation_ms = ms;
    }
    if let Some(mib) = chunk_mib {
        config.chunk_size = mib
            .checked_mul(1024 * 1024)
            .context("Chunk size is too large")?;
    }
    Ok(())
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password))
}

fn read_secret(confirm: bool) -> Result<ProtectedSecret> {
    let password = prompt_password("Enter password: ")?;
    if confirm {
        let again = prompt_password("Confirm password: ")?;
        if *password != *again {
            anyhow::bail!("Passwords do not match");
        }
    }
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    ProtectedSecret::from_password(password).context("Failed to protect password")
}

fn build_pipeline(config: &CryptConfig) -> Result<Arc<CryptoPipeline>> {
    let pipeline = CryptoPipeline::new(config.pipeline()).context("Invalid pipeline settings")?;
    Ok(Arc::new(pipeline))
}

/// Encrypt files in place.
async fn cmd_encrypt(config: &CryptConfig, files: Vec<PathBuf>, force: bool) -> Result<()> {
    let contract = config.contract().context("Invalid encryption settings")?;
    if contract.hmac().is_none() {
        anyhow::bail!("Configuration has no HMAC kind; new containers must carry a tag");
    }
    let pipeline = build_pipeline(config)?;

    let mut targets = Vec::with_capacity(files.len());
    for file in files {
        let encrypted = pipeline
            .has_header(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        if encrypted && !force {
            warn!(path = %file.display(), "Already encrypted, skipping (use --force)");
            continue;
        }
        targets.push(file);
    }
    if targets.is_empty() {
        println!("Nothing to encrypt.");
        return Ok(());
    }

    let secret = read_secret(true)?;
    let records = targets
        .into_iter()
        .map(|path| RequestRecord::encrypt(path, contract.clone()))
        .collect();
    run_requests(config, pipeline, records, &secret).await
}

/// Decrypt files in place.
async fn cmd_decrypt(config: &CryptConfig, files: Vec<PathBuf>) -> Result<()> {
    let pipeline = build_pipeline(config)?;
    let secret = read_secret(false)?;
    let records = files.into_iter().map(RequestRecord::decrypt).collect();
    run_requests(config, pipeline, records, &secret).await
}

/// Submit every record and follow scheduler events until all are done.
async fn run_requests(
    config: &CryptConfig,
    pipeline: Arc<CryptoPipeline>,
    records: Vec<RequestRecord>,
    secret: &ProtectedSecret,
) -> Result<()> {
    let (scheduler, task) = RequestScheduler::spawn(Arc::new(PipelineExecutor::new(pipeline)));
    let mut events = scheduler.subscribe();

    let total = records.len();
    for record in records {
        let job = Job::new(record, secret.duplicate()?).context("Invalid request")?;
        scheduler
            .submit(job, QueuePolicy::Enqueue)
            .await
            .context("Scheduler unavailable")?;
    }

    let mut tally = Tally::default();
    let mut last_percent = None;
    while tally.finished() < total {
        match events.recv().await {
            Ok(SchedulerEvent::Started { kind, path, .. }) => {
                last_percent = None;
                println!("{} {}", kind, path.display());
            }
            Ok(SchedulerEvent::Progress { progress, .. }) => {
                let percent = progress.percent();
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    info!("  {}%", percent);
                }
            }
            Ok(SchedulerEvent::Completed { path, .. }) => {
                tally.succeeded += 1;
                println!("  done: {}", path.display());
            }
            Ok(SchedulerEvent::Failed(report)) => {
                tally.failed += 1;
                eprintln!("  failed: {}: {}", report.path.display(), report.message);
                if config.resume_on_failure {
                    scheduler.resume().await?;
                } else {
                    break;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Dropped scheduler events");
                let status = scheduler.status().await?;
                if tally.reconcile(&status) && status.paused {
                    if config.resume_on_failure {
                        scheduler.resume().await?;
                    } else {
                        break;
                    }
                }
            }
            Err(RecvError::Closed) => break,
        }
    }

    let skipped = scheduler.shutdown().await?;
    task.await.context("Scheduler task panicked")?;

    println!(
        "{} succeeded, {} failed, {} skipped",
        tally.succeeded, tally.failed, skipped
    );
    if tally.failed > 0 || skipped > 0 {
        anyhow::bail!(
            "{} of {} operations did not complete",
            total.saturating_sub(tally.succeeded),
            total
        );
    }
    Ok(())
}

/// Finished operations seen so far.
#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    succeeded: usize,
    failed: usize,
}

impl Tally {
    fn finished(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Catch up with the scheduler's counters after dropped events.
    /// Returns true if failures were missed.
    fn reconcile(&mut self, status: &SchedulerStatus) -> bool {
        let missed_failure = status.failed as usize > self.failed;
        self.succeeded = self.succeeded.max(status.completed as usize);
        self.failed = self.failed.max(status.failed as usize);
        missed_failure
    }
}

/// Show the header of an encrypted file.
fn cmd_inspect(config: &CryptConfig, file: &Path) -> Result<()> {
    let pipeline = build_pipeline(config)?;
    let parsed = pipeline
        .inspect(file)
        .with_context(|| format!("Failed to read header of {}", file.display()))?;
    let meta = &parsed.metadata;

    println!("Container: {}", file.display());
    println!("  Version: {}", meta.version);
    println!("  Cipher: {} {}-bit", meta.cipher, meta.key_size_bits);
    println!("  Block/IV: {} / {} bits", meta.block_size_bits, meta.iv_size_bits);
    println!("  Key derivation: {}", meta.derivation);
    println!("  Iterations: {}", meta.iterations);
    println!("  Salt: {} bytes", meta.salt.len());
    match meta.hmac {
        Some(kind) => println!("  Authentication: {}", kind),
        None => println!("  Authentication: none"),
    }
    println!("  Header: {} bytes{}", parsed.header_len, if parsed.has_bom { " (BOM)" } else { "" });
    Ok(())
}

/// Measure key derivation speed on this machine.
fn cmd_calibrate(config: &CryptConfig) -> Result<()> {
    let target = Duration::from_millis(config.target_derivation_ms);
    info!(kdf = %config.derivation, "Calibrating key derivation");

    let profile = Calibrator::measure(config.derivation).context("Calibration failed")?;
    let iterations = profile
        .iterations_for(target)
        .context("Target is out of range")?;

    println!("Key derivation: {}", config.derivation);
    println!("  Throughput: {:.2} iterations/ms", profile.iterations_per_ms);
    println!("  Iterations for {} ms: {}", config.target_derivation_ms, iterations);
    Ok(())
}

/// Print the effective configuration.
fn cmd_config(config: &CryptConfig, path: Option<&Path>, save: bool) -> Result<()> {
    println!("{}", config.to_json()?);
    if save {
        let path = path.context("No configuration directory on this platform")?;
        config
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}
