use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tangled::config::{KnotConfig, SpindleConfig, load_toml};
use tangled::guard::{self, GuardOptions};
use tangled::knot::{self, KnotState};
use tangled::rbac::{Enforcer, THIS_SERVER, check_repo_format};
use tangled::spindle::process::ProcessEngine;
use tangled::spindle::secrets::{SecretsManager, SqliteSecrets, UnlockedSecret};
use tangled::spindle::{self, Engine, Runner, SpindleDb, SpindleState, workflow};
use tangled::types::{ManualInput, Pipeline, PushTrigger, Status, Trigger, TriggerKind, TriggerRepo, is_did, tid};

#[derive(Parser)]
#[command(name = "tangled")]
#[command(about = "Knot, SSH guard and spindle for a federated code-hosting platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// SSH forced command: authorize and exec git/pijul for a DID
    Guard {
        /// DID the SSH key belongs to
        #[arg(long)]
        user: String,

        /// Root directory holding repositories
        #[arg(long, default_value = "/home/git")]
        git_dir: PathBuf,

        /// JSON log file (stderr belongs to the SSH client)
        #[arg(long, default_value = "/tmp/guard.log")]
        log_path: PathBuf,

        /// Base URL of the knot's internal API
        #[arg(long, default_value = "http://localhost:5444")]
        internal_api: String,

        /// Message of the day shown to git clients
        #[arg(long)]
        motd_file: Option<PathBuf>,
    },

    /// Repository server
    Knot {
        #[command(subcommand)]
        command: KnotCommands,
    },

    /// CI workflow runner
    Spindle {
        #[command(subcommand)]
        command: SpindleCommands,
    },
}

#[derive(Args)]
struct KnotArgs {
    /// TOML config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the knot database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory holding repositories as <did>/<name>
    #[arg(long)]
    scan_root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum KnotCommands {
    /// Create the knot database and register the operator
    Init {
        #[command(flatten)]
        common: KnotArgs,

        /// DID of the knot operator
        #[arg(long)]
        owner: Option<String>,

        /// Skip interactive prompts
        #[arg(long)]
        non_interactive: bool,
    },

    /// Start the public XRPC server and the internal guard API
    Serve {
        #[command(flatten)]
        common: KnotArgs,

        /// Host to bind the public server to
        #[arg(long)]
        host: Option<String>,

        /// Port of the public server
        #[arg(long, short)]
        port: Option<u16>,

        /// Port of the internal guard API (always bound to the internal host)
        #[arg(long)]
        internal_port: Option<u16>,

        /// Public hostname used in immutable archive links
        #[arg(long)]
        hostname: Option<String>,

        /// Development mode: plain http links
        #[arg(long)]
        dev: bool,
    },

    /// Grant a DID push access to a repository
    AddCollaborator {
        #[command(flatten)]
        common: KnotArgs,

        /// Repository as <did>/<name>
        #[arg(long)]
        repo: String,

        /// DID to grant access to
        #[arg(long)]
        did: String,
    },
}

#[derive(Args)]
struct SpindleArgs {
    /// TOML config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the spindle database and workspaces
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory for per-workflow logs
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum SpindleCommands {
    /// Serve the spindle XRPC API
    Serve {
        #[command(flatten)]
        common: SpindleArgs,

        #[arg(long)]
        host: Option<String>,

        #[arg(long, short)]
        port: Option<u16>,

        /// Development mode: repo URLs reach the host from containers
        #[arg(long)]
        dev: bool,
    },

    /// Run a repository's workflows locally
    Run {
        #[command(flatten)]
        common: SpindleArgs,

        /// Repository checkout containing .tangled/workflows
        repo_dir: PathBuf,

        /// Owner DID recorded with the pipeline
        #[arg(long, default_value = "did:plc:local")]
        owner: String,

        /// Git ref to simulate a push to; omit for a manual run
        #[arg(long = "ref")]
        git_ref: Option<String>,

        /// Manual inputs as KEY=VALUE
        #[arg(long = "input")]
        inputs: Vec<String>,
    },

    /// Allow a knot (by DID) to submit pipelines
    AddMember {
        #[command(flatten)]
        common: SpindleArgs,

        #[arg(long)]
        did: String,
    },

    /// Store a secret for a repository
    AddSecret {
        #[command(flatten)]
        common: SpindleArgs,

        /// Repository as <did>/<name>
        #[arg(long)]
        repo: String,

        key: String,
        value: String,
    },
}

fn knot_config(args: &KnotArgs) -> anyhow::Result<KnotConfig> {
    let mut config: KnotConfig = match &args.config {
        Some(path) => load_toml(path)?,
        None => KnotConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(root) = &args.scan_root {
        config.scan_root = root.clone();
    }
    Ok(config)
}

fn spindle_config(args: &SpindleArgs) -> anyhow::Result<SpindleConfig> {
    let mut config: SpindleConfig = match &args.config {
        Some(path) => load_toml(path)?,
        None => SpindleConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
        if args.log_dir.is_none() {
            config.log_dir = dir.join("logs");
        }
    }
    if let Some(dir) = &args.log_dir {
        config.log_dir = dir.clone();
    }
    Ok(config)
}

fn open_enforcer(config: &KnotConfig) -> anyhow::Result<Enforcer> {
    let db_path = config.db_path();
    if !db_path.exists() {
        bail!("Knot not initialized. Run 'tangled knot init' first to create the database.");
    }
    Ok(Enforcer::new(&db_path)?)
}

fn run_knot_init(config: &KnotConfig, owner: Option<String>, non_interactive: bool) -> anyhow::Result<()> {
    fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();
    if db_path.exists() {
        bail!("Knot already initialized. Database exists at: {}", db_path.display());
    }

    let owner = match owner.or_else(|| config.owner.clone()) {
        Some(owner) => owner,
        None if non_interactive => bail!("--owner is required with --non-interactive"),
        None => inquire::Text::new("Operator DID:")
            .with_validator(|input: &str| {
                if is_did(input.trim()) {
                    Ok(inquire::validator::Validation::Valid)
                } else {
                    Ok(inquire::validator::Validation::Invalid(
                        "Must be a DID, e.g. did:plc:abc123".into(),
                    ))
                }
            })
            .prompt()?
            .trim()
            .to_string(),
    };
    if !is_did(&owner) {
        bail!("invalid owner DID: {owner}");
    }

    let enforcer = Enforcer::new(&db_path)?;
    enforcer.add_domain(THIS_SERVER)?;
    enforcer.add_server_owner(THIS_SERVER, &owner)?;

    println!();
    println!("========================================");
    println!("Knot initialized. Operator: {owner}");
    println!("Database: {}", db_path.display());
    println!("========================================");
    println!();
    Ok(())
}

async fn run_knot_serve(config: KnotConfig) -> anyhow::Result<()> {
    let enforcer = Arc::new(open_enforcer(&config)?);
    knot::register_repos(&config, &enforcer)?;

    let public_addr = config.socket_addr()?;
    let internal_addr = config.internal_socket_addr()?;
    let state = Arc::new(KnotState::new(config, enforcer));

    let public = tokio::net::TcpListener::bind(public_addr).await?;
    let internal = tokio::net::TcpListener::bind(internal_addr).await?;
    info!("Starting knot on {} (internal API on {})", public_addr, internal_addr);

    let public_server = axum::serve(public, knot::create_router(Arc::clone(&state)));
    let internal_server = axum::serve(internal, knot::create_internal_router(state));
    tokio::try_join!(
        async { public_server.await.context("public server") },
        async { internal_server.await.context("internal server") },
    )?;
    Ok(())
}

fn open_spindle_db(config: &SpindleConfig) -> anyhow::Result<Arc<SpindleDb>> {
    fs::create_dir_all(&config.data_dir)?;
    fs::create_dir_all(&config.log_dir)?;
    let db = SpindleDb::new(config.db_path())?;
    db.initialize()?;
    Ok(Arc::new(db))
}

fn engines(config: &SpindleConfig) -> Vec<Arc<dyn Engine>> {
    vec![Arc::new(ProcessEngine::new(
        config.data_dir.join("workspaces"),
        config.workflow_timeout(),
    ))]
}

fn spindle_enforcer(config: &SpindleConfig) -> anyhow::Result<Enforcer> {
    fs::create_dir_all(&config.data_dir)?;
    let enforcer = Enforcer::new(config.data_dir.join("rbac.db"))?;
    enforcer.add_domain(THIS_SERVER)?;
    Ok(enforcer)
}

async fn run_spindle_serve(config: SpindleConfig) -> anyhow::Result<()> {
    let db = open_spindle_db(&config)?;
    let enforcer = spindle_enforcer(&config)?;
    if let Some(owner) = &config.owner {
        enforcer.add_server_owner(THIS_SERVER, owner)?;
    }

    let addr = config.socket_addr()?;
    let runner = Arc::new(Runner::new(
        Arc::clone(&db),
        Arc::new(SqliteSecrets::new(Arc::clone(&db))),
        config.log_dir.clone(),
        config.dev,
    ));
    let state = Arc::new(SpindleState {
        engines: engines(&config),
        config,
        db,
        enforcer: Arc::new(enforcer),
        runner,
    });

    info!("Starting spindle on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, spindle::create_router(state)).await?;
    Ok(())
}

fn parse_inputs(inputs: &[String]) -> anyhow::Result<Vec<ManualInput>> {
    inputs
        .iter()
        .map(|raw| match raw.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(ManualInput {
                key: key.to_string(),
                value: value.to_string(),
            }),
            _ => bail!("invalid input {raw:?}, expected KEY=VALUE"),
        })
        .collect()
}

fn repo_name(repo_dir: &Path) -> String {
    repo_dir
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "repo".to_string())
}

async fn run_spindle_local(
    config: SpindleConfig,
    repo_dir: PathBuf,
    owner: String,
    git_ref: Option<String>,
    inputs: Vec<String>,
) -> anyhow::Result<()> {
    let workflows = workflow::discover(&repo_dir)?;
    if workflows.is_empty() {
        bail!("no workflows found under {}", repo_dir.join(workflow::WORKFLOW_DIR).display());
    }

    let kind = match git_ref {
        Some(git_ref) => TriggerKind::Push(PushTrigger {
            git_ref,
            new_sha: String::new(),
            old_sha: String::new(),
        }),
        None => TriggerKind::Manual {
            inputs: parse_inputs(&inputs)?,
        },
    };
    let name = repo_name(&repo_dir);
    let pipeline = Pipeline {
        knot: config.hostname.clone(),
        rkey: tid(),
        repo_owner: owner.clone(),
        repo_name: name.clone(),
        sha: String::new(),
        created: Utc::now(),
        trigger: Some(Trigger {
            repo: Some(TriggerRepo {
                knot: config.hostname.clone(),
                did: owner,
                repo: name,
                default_branch: String::new(),
            }),
            kind,
        }),
    };

    let db = open_spindle_db(&config)?;
    let plan = spindle::plan(pipeline.clone(), workflows, &engines(&config));
    let names = plan.workflow_names();
    if names.is_empty() {
        warn!("no workflow matched the trigger");
        return Ok(());
    }
    db.add_pipeline(&pipeline, &names)?;

    let runner = Arc::new(Runner::new(
        Arc::clone(&db),
        Arc::new(SqliteSecrets::new(Arc::clone(&db))),
        config.log_dir.clone(),
        config.dev,
    ));
    runner.start_workflows(plan).await;

    let mut failed = false;
    for status in db.statuses(&pipeline.id())? {
        println!("{:<24} {}", status.workflow_id.name, status.status);
        failed |= status.status != Status::Success;
    }
    println!("logs: {}", config.log_dir.display());
    if failed {
        bail!("one or more workflows did not succeed");
    }
    Ok(())
}

#[cfg(unix)]
async fn run_guard(opts: GuardOptions) -> ! {
    let code = match guard::run(opts).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e}");
            1
        }
    };
    std::process::exit(code)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The guard logs to its own file; everything else logs to stderr.
    if let Commands::Guard {
        user,
        git_dir,
        log_path,
        internal_api,
        motd_file,
    } = cli.command
    {
        #[cfg(unix)]
        run_guard(GuardOptions {
            user,
            git_dir,
            log_path,
            internal_api,
            motd_file,
        })
        .await;
        #[cfg(not(unix))]
        bail!("the guard is only supported on unix");
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tangled=info".parse()?))
        .init();

    match cli.command {
        Commands::Guard { .. } => unreachable!("handled above"),
        Commands::Knot { command } => match command {
            KnotCommands::Init {
                common,
                owner,
                non_interactive,
            } => {
                run_knot_init(&knot_config(&common)?, owner, non_interactive)?;
            }
            KnotCommands::Serve {
                common,
                host,
                port,
                internal_port,
                hostname,
                dev,
            } => {
                let mut config = knot_config(&common)?;
                if let Some(host) = host {
                    config.host = host;
                }
                if let Some(port) = port {
                    config.port = port;
                }
                if let Some(port) = internal_port {
                    config.internal_port = port;
                }
                if let Some(hostname) = hostname {
                    config.hostname = hostname;
                }
                config.dev |= dev;
                run_knot_serve(config).await?;
            }
            KnotCommands::AddCollaborator { common, repo, did } => {
                check_repo_format(&repo)?;
                if !is_did(&did) {
                    bail!("invalid DID: {did}");
                }
                let enforcer = open_enforcer(&knot_config(&common)?)?;
                enforcer.add_collaborator(&did, THIS_SERVER, &repo)?;
                println!("Added {did} as a collaborator on {repo}");
            }
        },
        Commands::Spindle { command } => match command {
            SpindleCommands::Serve {
                common,
                host,
                port,
                dev,
            } => {
                let mut config = spindle_config(&common)?;
                if let Some(host) = host {
                    config.host = host;
                }
                if let Some(port) = port {
                    config.port = port;
                }
                config.dev |= dev;
                run_spindle_serve(config).await?;
            }
            SpindleCommands::Run {
                common,
                repo_dir,
                owner,
                git_ref,
                inputs,
            } => {
                run_spindle_local(spindle_config(&common)?, repo_dir, owner, git_ref, inputs).await?;
            }
            SpindleCommands::AddMember { common, did } => {
                if !is_did(&did) {
                    bail!("invalid DID: {did}");
                }
                spindle_enforcer(&spindle_config(&common)?)?.add_server_member(THIS_SERVER, &did)?;
                println!("Added {did} as a spindle member");
            }
            SpindleCommands::AddSecret {
                common,
                repo,
                key,
                value,
            } => {
                check_repo_format(&repo)?;
                let db = open_spindle_db(&spindle_config(&common)?)?;
                SqliteSecrets::new(db).add_secret(&UnlockedSecret {
                    repo: repo.clone(),
                    key: key.clone(),
                    value,
                    created_at: Utc::now(),
                    created_by: "cli".to_string(),
                })?;
                println!("Stored secret {key} for {repo}");
            }
        },
    }

    Ok(())
}
