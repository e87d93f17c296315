// SPDX-License-Identifier: MIT OR Apache-2.0
//! `gate-daemon`: starts the HTTP control plane described in §6, wiring a
//! single process-wide [`Orchestrator`] from `GATE_POLICY`/`GATE_DATA_DIR`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gate_config::{apply_env_overrides, load_config, load_policy_config, rollback_registry_path};
use gate_core::PolicyConfig;
use gate_daemon::AppState;
use gate_driver_core::DriverRegistry;
use gate_driver_file::FileWriteDriver;
use gate_driver_http::HttpPostDriver;
use gate_journal::Journal;
use gate_orchestrator::Orchestrator;
use gate_policy::PolicyEngine;
use gate_rollback_registry::RollbackRegistry;
use gate_store::GateStore;

/// HTTP control-plane daemon for the transaction gate.
#[derive(Debug, Parser)]
#[command(name = "gate-daemon", version, about = "Transaction gate HTTP control-plane daemon")]
struct Args {
    /// Path to a TOML config file. Falls back to defaults plus environment
    /// overrides (`GATE_DATA_DIR`, `GATE_POLICY`, `GATE_LOG`, `GATE_LISTEN`).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    apply_env_overrides(&mut config);

    let log_filter = config.log.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(log_filter)).init();

    let data_dir = PathBuf::from(config.data_dir.clone().unwrap_or_else(|| ".gate/data".to_string()));
    std::fs::create_dir_all(&data_dir)?;

    let policy_config = match &config.policy_path {
        Some(path) => {
            let path = PathBuf::from(path);
            let policy = load_policy_config(&path)?;
            let rollback_path = rollback_registry_path(&path);
            (policy, RollbackRegistry::load(&rollback_path)?)
        }
        None => {
            let policy = PolicyConfig {
                version: "unconfigured".to_string(),
                allow: Vec::new(),
                caps: gate_core::PolicyCaps::default(),
                require_approval_labels: Vec::new(),
                time_window: None,
            };
            (policy, RollbackRegistry::empty())
        }
    };

    let store = GateStore::open(&data_dir.join("gate.db"), data_dir.join("bundles")).await?;
    let journal = Journal::open(&data_dir.join("journal.jsonl"), gate_journal::system_clock())?;

    let mut registry = DriverRegistry::new();
    registry.register(Arc::new(FileWriteDriver));
    registry.register(Arc::new(HttpPostDriver::with_registry(policy_config.1.clone())));

    let orchestrator = Orchestrator::new(
        Arc::new(journal),
        store,
        Arc::new(registry),
        Arc::new(PolicyEngine::new(policy_config.0)),
        Arc::new(policy_config.1),
        gate_journal::system_clock(),
    );

    let listen = config.listen.unwrap_or_else(|| "127.0.0.1:8787".to_string());
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "gate-daemon listening");

    let app = gate_daemon::build_app(Arc::new(AppState { orchestrator }));
    axum::serve(listener, app).await?;
    Ok(())
}
