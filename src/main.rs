use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use flowgraph_core::{FlowConfig, TaskAction};
use flowgraph_engine::{FlowContext, FlowEngine, GraphSpec, SimpleEvaluator, Stepper};
use flowgraph_workflow::WorkflowService;

#[derive(Parser)]
#[command(name = "flowgraph", version, about = "Process graph engine with human tasks")]
struct Cli {
    /// Path to config file (defaults to ~/.flowgraph/config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a graph to completion (or for a number of steps)
    Run {
        /// Graph definition (.json or .toml)
        graph: PathBuf,
        #[command(flatten)]
        vars: VarArgs,
        /// Stop after this many node visits
        #[arg(long)]
        steps: Option<usize>,
        /// Instance id (random if omitted)
        #[arg(long)]
        instance: Option<String>,
    },
    /// Print the values of a stepper range such as `1:10:2` or `0...5`
    Stepper {
        range: String,
    },
    /// Show the effective configuration
    Config,
    /// Query and decide human tasks
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// List the tasks the actor can decide
    List {
        #[command(flatten)]
        target: TaskTarget,
    },
    /// Post a decision (forward, forward_jump, reject, withdraw, restart)
    Post {
        #[command(flatten)]
        target: TaskTarget,
        /// Node to decide
        node: String,
        /// Decision to post
        action: TaskAction,
    },
    /// Show where the instance stands
    Status {
        #[command(flatten)]
        target: TaskTarget,
    },
}

#[derive(Args)]
struct TaskTarget {
    /// Graph definition (.json or .toml)
    graph: PathBuf,
    /// Instance id
    #[arg(long)]
    instance: String,
    #[command(flatten)]
    vars: VarArgs,
}

#[derive(Args)]
struct VarArgs {
    /// Context variable as KEY=VALUE (VALUE is parsed as JSON when it can be)
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            graph,
            vars,
            steps,
            instance,
        } => {
            let engine = build_engine(&config);
            let graph_id = load_graph(&engine, &graph)?;
            let instance = instance.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut ctx = engine.new_context(instance);
            apply_vars(&mut ctx, &vars.vars)?;

            let outcome = match steps {
                Some(n) => engine.run_steps(&graph_id, n, &mut ctx).await,
                None => engine.run(&graph_id, &mut ctx).await,
            }
            .with_context(|| format!("running graph {}", graph_id))?;

            println!("Outcome: {:?}", outcome);
            println!("Trace:");
            for record in ctx.trace().records() {
                println!("  {} ({})", record.node_id, record.node_type);
            }
            println!("Variables:");
            let mut names: Vec<&String> = ctx.vars().keys().collect();
            names.sort();
            for name in names {
                println!("  {} = {}", name, ctx.vars()[name]);
            }
            if let Some(result) = ctx.result() {
                println!("Result: {}", result);
            }
        }
        Commands::Stepper { range } => {
            let stepper = Stepper::from(&range)
                .with_context(|| format!("parsing stepper range '{}'", range))?;
            for value in stepper.values() {
                println!("{}", value);
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Task { action } => handle_task(&config, action).await?,
    }

    Ok(())
}

async fn handle_task(config: &FlowConfig, command: TaskCommand) -> anyhow::Result<()> {
    let target = match &command {
        TaskCommand::List { target }
        | TaskCommand::Post { target, .. }
        | TaskCommand::Status { target } => target,
    };

    let engine = Arc::new(build_engine(config));
    let graph_id = load_graph(&engine, &target.graph)?;
    let service = WorkflowService::from_config(Arc::clone(&engine), config)
        .context("opening the task state store")?;
    let mut ctx = engine.new_context(target.instance.clone());
    apply_vars(&mut ctx, &target.vars.vars)?;

    match &command {
        TaskCommand::List { .. } => {
            let tasks = service.get_tasks(&graph_id, &mut ctx).await?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in tasks {
                println!("{}", serde_json::to_string(&task)?);
            }
        }
        TaskCommand::Post { node, action, .. } => {
            service
                .post_task(&graph_id, node, *action, &mut ctx)
                .await
                .with_context(|| format!("posting {:?} on {}", action, node))?;
            info!(graph_id = %graph_id, node = %node, ?action, "Task posted");
            let status = service.status(&graph_id, &mut ctx).await?;
            println!("{}", serde_json::to_string(&status)?);
        }
        TaskCommand::Status { .. } => {
            let status = service.status(&graph_id, &mut ctx).await?;
            println!("{}", serde_json::to_string(&status)?);
            for (key, state) in service.states(&ctx)? {
                println!("  {} {}", key.field(), state);
            }
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FlowConfig> {
    if let Some(path) = path {
        return FlowConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    let default = FlowConfig::default_path();
    if default.exists() {
        return FlowConfig::load(&default)
            .with_context(|| format!("loading config from {}", default.display()));
    }
    Ok(FlowConfig::default())
}

fn build_engine(config: &FlowConfig) -> FlowEngine {
    FlowEngine::new(Arc::new(SimpleEvaluator)).with_config(config.engine.clone())
}

/// Load a graph file into the engine and return its id.
fn load_graph(engine: &FlowEngine, path: &Path) -> anyhow::Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading graph file {}", path.display()))?;
    let spec = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => GraphSpec::from_toml(&text),
        _ => GraphSpec::from_json(&text),
    }
    .with_context(|| format!("parsing graph file {}", path.display()))?;
    let graph = spec
        .build()
        .with_context(|| format!("validating graph {}", spec.id))?;
    debug!(graph_id = %graph.id(), nodes = graph.nodes().len(), "Graph loaded");
    Ok(engine.load(graph).id().to_string())
}

fn apply_vars(ctx: &mut FlowContext, vars: &[String]) -> anyhow::Result<()> {
    for var in vars {
        let Some((key, raw)) = var.split_once('=') else {
            bail!("expected KEY=VALUE, got '{}'", var);
        };
        let value =
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        ctx.put(key.trim(), value);
    }
    Ok(())
}
