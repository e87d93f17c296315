// SPDX-License-Identifier: MIT OR Apache-2.0
//! `gate`: the thin CLI surface over a local Orchestrator instance (§6) —
//! `ingest`, `plan`, `approve`, `commit`, `revert`, `replay`, and `serve`,
//! each printing a JSON result to stdout and exiting with the code §6
//! assigns to its outcome.

use std::path::PathBuf;
use std::process::{Command as StdCommand, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use gate_config::{apply_env_overrides, load_config, load_policy_config, rollback_registry_path};
use gate_core::PolicyConfig;
use gate_driver_core::DriverRegistry;
use gate_driver_file::FileWriteDriver;
use gate_driver_http::HttpPostDriver;
use gate_error::ErrorCode;
use gate_journal::Journal;
use gate_orchestrator::Orchestrator;
use gate_policy::PolicyEngine;
use gate_replay::{Collaborator, ProcessOutput};
use gate_rollback_registry::RollbackRegistry;
use gate_store::GateStore;
use serde_json::json;

/// Success.
const EXIT_OK: i32 = 0;
/// Any error not covered by a more specific code below.
const EXIT_ERROR: i32 = 1;
/// Policy evaluation denied the bundle.
const EXIT_POLICY_DENIED: i32 = 2;
/// An approval is required but missing or stale.
const EXIT_APPROVAL_REQUIRED: i32 = 3;
/// Replay diverged from the recorded run.
const EXIT_REPLAY_MISMATCH: i32 = 4;

#[derive(Debug, Parser)]
#[command(name = "gate", version, about = "Transaction gate CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// `tracing_subscriber::EnvFilter` directive. Overrides `GATE_LOG`.
    #[arg(long, global = true)]
    log: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a trace bundle file into the gate's store.
    Ingest {
        /// Path to a `.tgz` bundle file.
        bundle_path: PathBuf,
    },
    /// Evaluate policy for an ingested bundle without committing it.
    Plan {
        bundle_id: String,
    },
    /// Record approval for a bundle under the current policy version.
    Approve {
        bundle_id: String,
        #[arg(long)]
        actor: String,
    },
    /// Commit a planned bundle's intents through their drivers.
    Commit {
        bundle_id: String,
    },
    /// Revert a committed bundle's intents via their drivers' `revert`.
    Revert {
        bundle_id: String,
    },
    /// Replay a bundle against an external collaborator command and diff
    /// its output against the recorded logs.
    Replay {
        /// Path to a `.tgz` bundle file.
        bundle_path: PathBuf,
        /// Command to run as the sandbox collaborator. Invoked once with
        /// the reconstructed filesystem root as its working directory and
        /// the recorded clock seed in `GATE_REPLAY_CLOCK_SEED`.
        #[arg(long)]
        collaborator: String,
    },
    /// Start the HTTP control-plane daemon.
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = load_config(None).unwrap_or_default();
    apply_env_overrides(&mut config);
    let log_filter = cli.log.or(config.log.clone()).unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(log_filter)).init();

    let exit_code = match run(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_ERROR
        }
    };
    std::process::exit(exit_code);
}

async fn build_orchestrator(config: &gate_config::GateConfig) -> Result<Orchestrator> {
    let data_dir = PathBuf::from(config.data_dir.clone().unwrap_or_else(|| ".gate/data".to_string()));
    std::fs::create_dir_all(&data_dir).context("create data dir")?;

    let (policy, rollback_registry) = match &config.policy_path {
        Some(path) => {
            let path = PathBuf::from(path);
            let policy = load_policy_config(&path).context("load policy")?;
            let rollback_path = rollback_registry_path(&path);
            let registry = RollbackRegistry::load(&rollback_path).context("load rollback registry")?;
            (policy, registry)
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

    let store = GateStore::open(&data_dir.join("gate.db"), data_dir.join("bundles")).await.context("open gate store")?;
    let journal = Journal::open(&data_dir.join("journal.jsonl"), gate_journal::system_clock()).context("open journal")?;

    let mut registry = DriverRegistry::new();
    registry.register(Arc::new(FileWriteDriver));
    registry.register(Arc::new(HttpPostDriver::with_registry(rollback_registry.clone())));

    Ok(Orchestrator::new(
        Arc::new(journal),
        store,
        Arc::new(registry),
        Arc::new(PolicyEngine::new(policy)),
        Arc::new(rollback_registry),
        gate_journal::system_clock(),
    ))
}

async fn run(command: Commands, config: &gate_config::GateConfig) -> Result<i32> {
    match command {
        Commands::Ingest { bundle_path } => {
            let orchestrator = build_orchestrator(config).await?;
            let bytes = std::fs::read(&bundle_path).with_context(|| format!("read {}", bundle_path.display()))?;
            match orchestrator.ingest(bytes).await {
                Ok(bundle_id) => {
                    println!("{}", json!({ "bundleId": bundle_id }));
                    Ok(EXIT_OK)
                }
                Err(e) => {
                    println!("{}", error_json(&e));
                    Ok(EXIT_ERROR)
                }
            }
        }
        Commands::Plan { bundle_id } => {
            let orchestrator = build_orchestrator(config).await?;
            match orchestrator.plan(&bundle_id).await {
                Ok(plan) => {
                    println!("{}", serde_json::to_string(&plan)?);
                    Ok(EXIT_OK)
                }
                Err(e) => {
                    println!("{}", error_json(&e));
                    Ok(EXIT_ERROR)
                }
            }
        }
        Commands::Approve { bundle_id, actor } => {
            let orchestrator = build_orchestrator(config).await?;
            match orchestrator.approve(&bundle_id, actor).await {
                Ok(approval) => {
                    println!("{}", json!({ "status": "approved", "bundleId": bundle_id, "approval": approval }));
                    Ok(EXIT_OK)
                }
                Err(e) => {
                    println!("{}", error_json(&e));
                    Ok(EXIT_ERROR)
                }
            }
        }
        Commands::Commit { bundle_id } => {
            let orchestrator = build_orchestrator(config).await?;
            match orchestrator.commit(&bundle_id).await {
                Ok(outcome) => {
                    println!("{}", json!({ "status": "committed", "receipts": outcome.receipts }));
                    Ok(EXIT_OK)
                }
                Err(commit_err) => {
                    println!("{}", error_json(&commit_err.error));
                    Ok(match commit_err.error.code() {
                        ErrorCode::PolicyDenied => EXIT_POLICY_DENIED,
                        ErrorCode::ApprovalRequired => EXIT_APPROVAL_REQUIRED,
                        _ => EXIT_ERROR,
                    })
                }
            }
        }
        Commands::Revert { bundle_id } => {
            let orchestrator = build_orchestrator(config).await?;
            match orchestrator.revert(&bundle_id).await {
                Ok(outcomes) => {
                    let ok = outcomes.iter().all(|o| o.ok);
                    println!("{}", json!({ "status": "reverted", "outcomes": outcomes }));
                    Ok(if ok { EXIT_OK } else { EXIT_ERROR })
                }
                Err(e) => {
                    println!("{}", error_json(&e));
                    Ok(EXIT_ERROR)
                }
            }
        }
        Commands::Replay { bundle_path, collaborator } => {
            let bundle = gate_bundle::open(&bundle_path).with_context(|| format!("open {}", bundle_path.display()))?;
            let runner = SubprocessCollaborator { command: collaborator };
            match gate_replay::replay(&bundle, &runner).await {
                Ok(result) => {
                    let success = result.success;
                    println!("{}", serde_json::to_string(&result)?);
                    Ok(if success { EXIT_OK } else { EXIT_REPLAY_MISMATCH })
                }
                Err(e) => {
                    println!("{}", error_json(&e));
                    Ok(EXIT_ERROR)
                }
            }
        }
        Commands::Serve => {
            let orchestrator = build_orchestrator(config).await?;
            let listen = config.listen.clone().unwrap_or_else(|| "127.0.0.1:8787".to_string());
            let listener = tokio::net::TcpListener::bind(&listen).await.context("bind listen address")?;
            tracing::info!(%listen, "gate serve listening");
            let app = gate_daemon::build_app(Arc::new(gate_daemon::AppState { orchestrator }));
            axum::serve(listener, app).await.context("serve")?;
            Ok(EXIT_OK)
        }
    }
}

fn error_json(error: &gate_error::GateError) -> serde_json::Value {
    let reasons = error.reasons();
    json!({
        "error": error.code().as_str(),
        "message": error.message(),
        "reasons": reasons,
    })
}

/// A [`Collaborator`] that shells out to an external command for the agent
/// launch step. The sandbox/proxy this wraps is out of scope (§1); this is
/// the thinnest possible bridge from the `--collaborator` flag to that seam
/// — no proxy is started, and the command runs with the reconstructed
/// filesystem root as its working directory.
struct SubprocessCollaborator {
    command: String,
}

#[async_trait]
impl Collaborator for SubprocessCollaborator {
    async fn start_proxy(&self, _network_har: &serde_json::Value) -> Result<(), gate_error::GateError> {
        Ok(())
    }

    async fn run_agent(
        &self,
        root: &std::path::Path,
        clock_seed: &serde_json::Value,
        _start_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<ProcessOutput, gate_error::GateError> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            gate_error::GateError::new(gate_error::ErrorCode::ReplayDiff, "collaborator command is empty")
        })?;

        let output = StdCommand::new(program)
            .args(parts)
            .current_dir(root)
            .env("GATE_REPLAY_CLOCK_SEED", clock_seed.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                gate_error::GateError::new(gate_error::ErrorCode::ReplayDiff, "failed to launch collaborator command")
                    .with_source(e)
            })?;

        Ok(ProcessOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn stop_proxy(&self) -> Result<(), gate_error::GateError> {
        Ok(())
    }
}
