//! rxledger server binary.
//!
//! Reads `config.toml` (or the path given with `--config`) under `RXLEDGER_*`
//! environment overrides, opens the SQLite ledger and mirror, starts the
//! reconciler and notification dispatcher, and serves the JSON API under
//! `/api`.
//!
//! # Salt generation
//!
//! To generate a value for `patient_salt`:
//!
//! ```
//! cargo run -p rxledger-server -- --generate-salt
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use axum::Router;
use clap::Parser;
use rand_core::{OsRng, RngCore as _};
use rxledger_core::commitment::IdentifierHasher;
use rxledger_server::ServerConfig;
use rxledger_service::{
  ConfiguredNotifier, NotificationDispatcher, OtpConsent, PrescriptionService, Reconciler,
};
use rxledger_store_sqlite::{SqliteLedger, SqliteMirror};
use tokio::{net::TcpListener, signal, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "rxledger prescription server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  /// Print a random hex salt suitable for `patient_salt` and exit.
  #[arg(long)]
  generate_salt: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Helper mode: print a salt and exit.
  if cli.generate_salt {
    let mut bytes = [0u8; 32];
    OsRng
      .try_fill_bytes(&mut bytes)
      .context("failed to read from the OS entropy source")?;
    println!("{}", hex::encode(bytes));
    return Ok(());
  }

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("RXLEDGER").separator("__"))
    .build()
    .context("failed to read configuration")?;

  let server_cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;

  let hasher = IdentifierHasher::new(server_cfg.patient_salt.clone())
    .context("patient_salt must not be empty")?;

  // Open SQLite stores.
  let ledger_path = expand_tilde(&server_cfg.ledger_path);
  let ledger = SqliteLedger::open(&ledger_path)
    .await
    .with_context(|| format!("failed to open ledger at {ledger_path:?}"))?
    .with_policy(server_cfg.service.policy.clone());
  let ledger = Arc::new(ledger);

  let mirror_path = expand_tilde(&server_cfg.mirror_path);
  let mirror = SqliteMirror::open(&mirror_path)
    .await
    .with_context(|| format!("failed to open mirror at {mirror_path:?}"))?;
  let mirror = Arc::new(mirror);

  // Background workers.
  let (shutdown_tx, shutdown_rx) = watch::channel(false);

  let reconciler = Reconciler::new(
    ledger.clone(),
    mirror.clone(),
    server_cfg.service.store_ref.clone(),
    server_cfg.reconciler.clone(),
  );
  let reconciler_task = tokio::spawn(reconciler.run(shutdown_rx.clone()));

  let notifier = ConfiguredNotifier::from_config(&server_cfg.dispatcher)
    .context("failed to build notification client")?;
  let dispatcher =
    NotificationDispatcher::new(mirror.clone(), notifier, server_cfg.dispatcher.clone());
  let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_rx));

  // Build application state.
  let consent = Arc::new(OtpConsent::new(mirror.clone(), &server_cfg.consent));
  let service = Arc::new(PrescriptionService::new(
    ledger,
    mirror,
    consent,
    hasher,
    server_cfg.service.clone(),
  ));

  let app = Router::new()
    .nest("/api", rxledger_api::api_router(service))
    .layer(TraceLayer::new_for_http());
  let address = server_cfg.address();

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

  // Stop the workers and let any in-flight pass finish.
  let _ = shutdown_tx.send(true);
  let (reconciler, dispatcher) = tokio::join!(reconciler_task, dispatcher_task);
  reconciler.context("reconciler task panicked")?;
  dispatcher.context("dispatcher task panicked")?;

  Ok(())
}

async fn shutdown_signal() {
  let _ = signal::ctrl_c().await;
  tracing::info!("shutdown requested");
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  match (s.strip_prefix("~/"), std::env::var("HOME")) {
    (Some(rest), Ok(home)) => PathBuf::from(home).join(rest),
    _ => path.to_path_buf(),
  }
}
