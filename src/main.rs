use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use evidence_keeper::anchor::build_provider;
use evidence_keeper::config::{KeeperConfig, LogFormat};
use evidence_keeper::crypto::hash::Digest;
use evidence_keeper::error::{KeeperError, Result};
use evidence_keeper::keeper::Keeper;
use evidence_keeper::server;
use evidence_keeper::store::{self, models::NewEvidenceJob};

#[derive(Parser)]
#[command(name = "evidence-keeper")]
#[command(about = "Anchors evidence digests onto blockchains and tracks their confirmation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job processor and confirmation poller (default)
    Run,
    /// Apply database migrations and exit
    Migrate,
    /// Queue a digest for anchoring
    Enqueue {
        /// SHA-256 digest, 64 hex characters, optional 0x prefix
        digest: String,
        /// Job id; a UUIDv7 is generated when omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// Show a job and its transaction refs
    Status { job_id: String },
    /// Print and verify the Merkle inclusion proof of a batched job
    Proof { job_id: String },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match KeeperConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("evidence-keeper: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.log_format);

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Migrate => store::connect(&config.db_url).await.map(|_| ()),
        Commands::Enqueue { digest, id } => enqueue(&config, &digest, id).await,
        Commands::Status { job_id } => status(&config, &job_id).await,
        Commands::Proof { job_id } => proof(&config, &job_id).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "evidence-keeper failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: KeeperConfig) -> Result<()> {
    info!(
        provider = ?config.provider,
        batching = config.batch.enabled,
        "Starting evidence keeper"
    );

    // Everything that can fail at startup happens before the loops spawn
    let store = store::connect(&config.db_url).await?;
    let provider = build_provider(&config)?;
    let listener = server::bind(&config.health_addr).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health = tokio::spawn(server::serve(listener, shutdown_rx.clone()));
    let keeper = tokio::spawn(Keeper::new(store, provider, &config).run(shutdown_rx));

    shutdown_signal().await?;
    info!("Shutdown requested, finishing in-flight work");
    let _ = shutdown_tx.send(true);

    keeper.await??;
    health.await??;
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            ctrl_c = tokio::signal::ctrl_c() => ctrl_c?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

async fn enqueue(config: &KeeperConfig, digest: &str, id: Option<String>) -> Result<()> {
    let digest: Digest = digest.parse()?;
    let store = store::connect(&config.db_url).await?;

    let mut job = NewEvidenceJob::new(digest);
    job.id = id;
    let job = store.enqueue(job).await?;

    info!(job_id = %job.id, digest = %job.payload_digest, "Job queued");
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn status(config: &KeeperConfig, job_id: &str) -> Result<()> {
    let store = store::connect(&config.db_url).await?;
    let job = store
        .get_job(job_id)
        .await?
        .ok_or_else(|| KeeperError::Config(format!("no such job: {job_id}")))?;
    let refs = store.tx_refs_for_job(job_id).await?;

    let report = serde_json::json!({ "job": job, "tx_refs": refs });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn proof(config: &KeeperConfig, job_id: &str) -> Result<()> {
    let store = store::connect(&config.db_url).await?;
    let job = store
        .get_job(job_id)
        .await?
        .ok_or_else(|| KeeperError::Config(format!("no such job: {job_id}")))?;
    let stored = store
        .fetch_proof(job_id)
        .await?
        .ok_or_else(|| KeeperError::MerkleVerification(format!("{job_id} has no batch proof")))?;

    if !stored.verifies(&job.digest()?) {
        return Err(KeeperError::MerkleVerification(job_id.to_string()));
    }

    println!("{}", serde_json::to_string_pretty(&stored)?);
    Ok(())
}
