//! orbitd — the Orbit operator binary.
//!
//! Offline inspection and repair against an `orbit.toml` and the local
//! state store:
//! - deployment name formatting and parsing
//! - manifest rendering for a plan
//! - deployment locks
//! - backup metadata and job schedules
//!
//! # Usage
//!
//! ```text
//! orbitd --config /etc/orbit/orbit.toml name format --plan small --index 3 --instance 8f1c
//! orbitd --data-dir /var/lib/orbit lock release orbit-0003-8f1c
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info};

use orbit_core::{OrbitConfig, PlanConfig};
use orbit_director::{BackupStore, DeploymentLock, DeploymentNamer, ManifestContext, ManifestGenerator};
use orbit_state::StateStore;

#[derive(Parser)]
#[command(name = "orbitd", about = "Orbit deployment orchestrator operator tool")]
struct Cli {
    /// Orchestrator configuration file.
    #[arg(long, global = true, default_value = "orbit.toml")]
    config: PathBuf,

    /// Data directory holding the state store.
    #[arg(long, global = true, default_value = "/var/lib/orbit")]
    data_dir: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format or parse deployment names of a plan.
    Name {
        #[command(subcommand)]
        action: NameAction,
    },
    /// Render the manifest of a plan for one instance.
    Render {
        #[arg(long)]
        plan: String,
        #[arg(long)]
        index: u32,
        #[arg(long)]
        instance: String,
        /// Request parameters as a JSON object.
        #[arg(long)]
        parameters: Option<String>,
    },
    /// Inspect or release deployment locks.
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Inspect backup metadata.
    Backups {
        #[command(subcommand)]
        action: BackupsAction,
    },
    /// Inspect registered job schedules.
    Schedules {
        #[command(subcommand)]
        action: SchedulesAction,
    },
}

#[derive(Subcommand)]
enum NameAction {
    Format {
        #[arg(long)]
        plan: String,
        #[arg(long)]
        index: u32,
        #[arg(long)]
        instance: String,
    },
    Parse {
        #[arg(long)]
        plan: String,
        name: String,
    },
}

#[derive(Subcommand)]
enum LockAction {
    Show { deployment: String },
    Release { deployment: String },
}

#[derive(Subcommand)]
enum BackupsAction {
    List {
        /// Only backups started at least this many days ago.
        #[arg(long, default_value = "0")]
        older_than_days: i64,
        /// Leave out out-of-band backups.
        #[arg(long)]
        tenant_only: bool,
    },
}

#[derive(Subcommand)]
enum SchedulesAction {
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    match cli.command {
        Command::Name { action } => {
            let config = load_config(&cli.config)?;
            match action {
                NameAction::Format { plan, index, instance } => {
                    let namer = namer_for(&config, plan_of(&config, &plan)?)?;
                    println!("{}", namer.format(index, &instance));
                }
                NameAction::Parse { plan, name } => {
                    let namer = namer_for(&config, plan_of(&config, &plan)?)?;
                    let identity = namer.parse(&name)?;
                    let out = serde_json::json!({
                        "subnet": identity.subnet,
                        "index": identity.index,
                        "instance_id": identity.instance_id,
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Command::Render {
            plan,
            index,
            instance,
            parameters,
        } => {
            let config = load_config(&cli.config)?;
            let plan = plan_of(&config, &plan)?;
            let namer = namer_for(&config, plan)?;
            let generator = ManifestGenerator::new(
                config.infrastructure.clone(),
                plan.clone(),
                config.network_name_for(plan),
            );
            let parameters: Value = match parameters {
                Some(raw) => serde_json::from_str(&raw).context("--parameters is not valid JSON")?,
                None => Value::Object(Default::default()),
            };
            let ctx = ManifestContext {
                parameters,
                ..ManifestContext::default()
            };
            let deployment = namer.format(index, &instance);
            print!("{}", generator.generate(&deployment, index, &ctx)?);
        }
        Command::Lock { action } => {
            let store = open_store(&cli.data_dir)?;
            let lock = DeploymentLock::new(Arc::new(store));
            match action {
                LockAction::Show { deployment } => match lock.current(&deployment).await? {
                    Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
                    None => println!("{deployment} is not locked"),
                },
                LockAction::Release { deployment } => {
                    lock.release(&deployment).await?;
                    info!(%deployment, "lock released by operator");
                }
            }
        }
        Command::Backups {
            action:
                BackupsAction::List {
                    older_than_days,
                    tenant_only,
                },
        } => {
            if older_than_days < 0 {
                bail!("--older-than-days must not be negative");
            }
            let store = open_store(&cli.data_dir)?;
            let older_than = Utc::now() - Duration::days(older_than_days);
            let entries = store.list_backup_files(older_than, None, !tenant_only).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Command::Schedules {
            action: SchedulesAction::List,
        } => {
            let store = open_store(&cli.data_dir)?;
            println!("{}", serde_json::to_string_pretty(&store.list_schedules()?)?);
        }
    }

    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,orbitd=debug,orbit=debug"))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<OrbitConfig> {
    let config = OrbitConfig::from_file(path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    config.validate()?;
    debug!(path = %path.display(), plans = config.plans.len(), "config loaded");
    Ok(config)
}

fn plan_of<'a>(config: &'a OrbitConfig, plan_id: &str) -> anyhow::Result<&'a PlanConfig> {
    config
        .plan(plan_id)
        .with_context(|| format!("plan {plan_id} is not configured"))
}

fn namer_for(config: &OrbitConfig, plan: &PlanConfig) -> anyhow::Result<DeploymentNamer> {
    Ok(DeploymentNamer::new(
        config.director.prefix.clone(),
        config.subnet_for(plan),
    )?)
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("orbit.redb");
    let store = StateStore::open(&db_path)?;
    debug!(path = ?db_path, "state store opened");
    Ok(store)
}
