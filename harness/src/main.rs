//! `harness` CLI: run or check declarative blueprint files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};

use harness::agent::CommandAgentDispatcher;
use harness::blueprint::loader::load_blueprint;
use harness::blueprint::{Blueprint, NodeKind};
use harness::engine::TracingSink;
use harness::exit_codes;
use harness::io::config::{DEFAULT_CONFIG_PATH, HarnessConfig, load_config};
use harness::io::control_plane::{HttpControlPlane, HttpControlPlaneConfig};
use harness::io::report::write_report;
use harness::logging;
use harness::run::{PublishOptions, RunRequest, execute_run};
use harness::sandbox::local::{LocalSandbox, LocalSandboxOptions};
use harness::sandbox::remote::{RemoteSandbox, RemoteSandboxOptions};

/// Host env var holding the push credential for `--push`.
const PUSH_TOKEN_ENV: &str = "HARNESS_PUSH_TOKEN";

#[derive(Parser)]
#[command(
    name = "harness",
    version,
    about = "Run automation blueprints inside an isolated sandbox"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a blueprint against a repository and write a JSON report.
    Run(RunArgs),
    /// Compile a blueprint and list its nodes without running anything.
    Check {
        blueprint: PathBuf,
        /// Config file (defaults to `<repo>/.harness/config.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Local,
    Remote,
}

#[derive(clap::Args)]
struct RunArgs {
    blueprint: PathBuf,
    /// Source repository for the local backend; config lookup root.
    #[arg(long, default_value = ".")]
    repo: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = Backend::Local)]
    backend: Backend,
    /// Free-text intent made available to prompts.
    #[arg(long, default_value = "")]
    intent: String,
    /// Fixed run id (8 lowercase hex characters).
    #[arg(long)]
    run_id: Option<String>,
    /// Host env vars to pass into the run, by name.
    #[arg(long = "env", value_name = "KEY")]
    env: Vec<String>,
    /// Push the run branch after a successful run.
    #[arg(long)]
    push: bool,
    /// Report path (defaults to `<repo>/.harness/reports/<run-id>.json`).
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Check {
            blueprint,
            config,
            repo,
        } => cmd_check(&blueprint, config.as_deref(), &repo),
    }
}

fn config_for(repo: &Path, explicit: Option<&Path>) -> Result<HarnessConfig> {
    match explicit {
        Some(path) => load_config(path),
        None => load_config(&repo.join(DEFAULT_CONFIG_PATH)),
    }
}

/// Agent names referenced by delegated and repair nodes.
fn referenced_agents(blueprint: &Blueprint) -> Vec<&str> {
    blueprint
        .nodes()
        .iter()
        .filter_map(|node| match &node.kind {
            NodeKind::Delegated(delegated) => Some(delegated.agent.as_str()),
            NodeKind::Validate(validate) => Some(validate.repair.agent.as_str()),
            NodeKind::Gate(_) | NodeKind::Exact(_) => None,
        })
        .collect()
}

fn ensure_agents_known(blueprint: &Blueprint, dispatcher: &CommandAgentDispatcher) -> Result<()> {
    let missing: Vec<&str> = referenced_agents(blueprint)
        .into_iter()
        .filter(|agent| !dispatcher.knows(agent))
        .collect();
    if !missing.is_empty() {
        bail!("blueprint uses agents missing from config: {}", missing.join(", "));
    }
    Ok(())
}

fn cmd_check(path: &Path, config: Option<&Path>, repo: &Path) -> Result<i32> {
    let cfg = config_for(repo, config)?;
    let blueprint = load_blueprint(path, Duration::from_secs(cfg.default_timeout_secs))?;
    let dispatcher = CommandAgentDispatcher::new(cfg.agents.clone(), cfg.agent_output_limit_bytes);
    ensure_agents_known(&blueprint, &dispatcher)?;
    println!("{}: {}", blueprint.name(), blueprint.description());
    for node in blueprint.nodes() {
        let skip = if node.skip.is_some() { " (conditional)" } else { "" };
        println!("  {:<9} {}{}", node.kind.label(), node.name, skip);
    }
    Ok(exit_codes::OK)
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let repo = args
        .repo
        .canonicalize()
        .with_context(|| format!("resolve repo {}", args.repo.display()))?;
    let cfg = config_for(&repo, args.config.as_deref())?;
    let blueprint = load_blueprint(&args.blueprint, Duration::from_secs(cfg.default_timeout_secs))?;
    let dispatcher = CommandAgentDispatcher::new(cfg.agents.clone(), cfg.agent_output_limit_bytes);
    ensure_agents_known(&blueprint, &dispatcher)?;

    let mut env = BTreeMap::new();
    for key in &args.env {
        let value = std::env::var(key).with_context(|| format!("--env {key} is not set"))?;
        env.insert(key.clone(), value);
    }

    let request = RunRequest {
        blueprint: &blueprint,
        branch_prefix: &cfg.branch_prefix,
        intent: args.intent.clone(),
        repo: match args.backend {
            Backend::Local => repo.display().to_string(),
            Backend::Remote => cfg.remote.repo_url.clone(),
        },
        env,
        run_id: args.run_id.clone(),
        publish: args.push.then(|| PublishOptions {
            token: std::env::var(PUSH_TOKEN_ENV).ok(),
            reviewer: None,
        }),
    };
    let mut sink = TracingSink;

    let report = match args.backend {
        Backend::Local => execute_run(
            request,
            |branch| {
                let mut options = LocalSandboxOptions::new(&repo, branch);
                if let Some(dir) = &cfg.worktree_dir {
                    options.worktree_parent = dir.clone();
                }
                options.author = (&cfg.snapshot_author).into();
                options.default_output_limit = cfg.exec_output_limit_bytes;
                LocalSandbox::create(options)
            },
            &dispatcher,
            &mut sink,
        )?,
        Backend::Remote => {
            if cfg.remote.repo_url.trim().is_empty() {
                return Err(anyhow!("remote.repo_url must be set for the remote backend"));
            }
            let plane = HttpControlPlane::connect(HttpControlPlaneConfig {
                base_url: cfg.remote.api_url.clone(),
                token: std::env::var(&cfg.remote.api_token_env).ok(),
                request_timeout: Duration::from_secs(60),
            })?;
            execute_run(
                request,
                |branch| {
                    let mut options = RemoteSandboxOptions::new(
                        cfg.remote.base_image.clone(),
                        cfg.remote.repo_url.clone(),
                        branch,
                    );
                    options.root = cfg.remote.workdir.clone();
                    options.author = (&cfg.snapshot_author).into();
                    options.bootstrap_timeout = Duration::from_secs(cfg.remote.bootstrap_timeout_secs);
                    options.default_output_limit = cfg.exec_output_limit_bytes;
                    RemoteSandbox::create(plane, options)
                },
                &dispatcher,
                &mut sink,
            )?
        }
    };

    let report_path = args.report.clone().unwrap_or_else(|| {
        repo.join(".harness")
            .join("reports")
            .join(format!("{}.json", report.run_id))
    });
    write_report(&report_path, &report)?;
    println!("{}", report_path.display());

    if let Some(push) = &report.push
        && let Some(error) = &push.error
    {
        eprintln!("publish: {error}");
    }
    Ok(if report.succeeded() {
        exit_codes::OK
    } else {
        exit_codes::RUN_FAILED
    })
}
