use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flowcore::{ExecutableGraph, ExecutionEvent, ExecutionOptions, FailureAction, FlowDefinition, NodeDefinition, Status};
use flowexec::{ExecutorConfig, FlowRunnerManager, InMemoryExecutorLoader, JobTypeRegistry, LocalProjectLoader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const EXECUTION_ID: u64 = 1;

#[derive(Parser)]
#[command(name = "flowexec")]
#[command(about = "Flow execution engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow definition file
    Run {
        /// Path to flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Executor configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Flow parameter as key=value, repeatable
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// What to do with the rest of the flow when a job fails
        #[arg(long, value_enum, default_value_t = OnFailure::FinishCurrent)]
        failure_action: OnFailure,

        /// Nested id of a job to disable, repeatable
        #[arg(long)]
        disable: Vec<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a flow definition file
    Validate {
        /// Path to flow JSON file
        file: PathBuf,
    },

    /// List available job types
    JobTypes,

    /// Create a new example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OnFailure {
    FinishCurrent,
    CancelAll,
    FinishAll,
}

impl From<OnFailure> for FailureAction {
    fn from(value: OnFailure) -> Self {
        match value {
            OnFailure::FinishCurrent => FailureAction::FinishCurrentlyRunning,
            OnFailure::CancelAll => FailureAction::CancelAll,
            OnFailure::FinishAll => FailureAction::FinishAllPossible,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            config,
            params,
            failure_action,
            disable,
            verbose,
        } => {
            init_logging(verbose);
            let mut options = ExecutionOptions::default().with_failure_action(failure_action.into());
            for param in &params {
                let (key, value) = param
                    .split_once('=')
                    .ok_or_else(|| anyhow!("parameter `{}` is not KEY=VALUE", param))?;
                options = options.with_flow_parameter(key.trim(), value.trim());
            }
            for job in disable {
                options = options.with_disabled_job(job);
            }
            run_flow(file, config, options).await?;
        }

        Commands::Validate { file } => {
            validate_flow(file)?;
        }

        Commands::JobTypes => {
            list_job_types();
        }

        Commands::Init { output } => {
            create_example_flow(output)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

fn load_definition(file: &Path) -> Result<FlowDefinition> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("cannot read {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a valid flow definition", file.display()))
}

fn current_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "flowexec".to_string())
}

async fn run_flow(file: PathBuf, config: Option<PathBuf>, options: ExecutionOptions) -> Result<()> {
    println!("🚀 Loading flow from: {}", file.display());
    let definition = load_definition(&file)?;
    let config = match config {
        Some(path) => ExecutorConfig::from_file(&path)?,
        None => ExecutorConfig::default(),
    };
    tracing::debug!("Executor config: {:?}", config);

    let graph = ExecutableGraph::from_definition(EXECUTION_ID, &definition)?
        .with_submit_user(current_user())
        .with_options(options)?;
    println!("📋 Flow: {}", graph.flow_id);
    println!("   Nodes: {}", graph.len() - 1);
    println!();

    let loader = Arc::new(InMemoryExecutorLoader::new());
    loader.insert(graph).await;

    let project_dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let manager = FlowRunnerManager::new(config, loader.clone(), Arc::new(flowjobs::default_registry()))
        .with_project_loader(Arc::new(LocalProjectLoader::single(project_dir)));

    let printer = manager.events().listen(|event| match event {
        ExecutionEvent::FlowStarted { flow_id, .. } => println!("▶️  Flow {} started", flow_id),
        ExecutionEvent::JobStarted { nested_id, attempt, .. } => {
            if attempt > 0 {
                println!("  ⚡ Starting job: {} (attempt {})", nested_id, attempt);
            } else {
                println!("  ⚡ Starting job: {}", nested_id);
            }
        }
        ExecutionEvent::JobFinished { nested_id, status, .. } => match status {
            Status::Succeeded => println!("  ✅ {} succeeded", nested_id),
            Status::Failed => println!("  ❌ {} failed", nested_id),
            other => println!("  ⏹️  {} {}", nested_id, other),
        },
        ExecutionEvent::FlowStatusChanged { status, .. } => println!("  🔄 Flow is {}", status),
        ExecutionEvent::JobStatusChanged { .. } => {}
        ExecutionEvent::FlowFinished { status, .. } => println!("🏁 Flow finished: {}", status),
    });

    manager.submit(EXECUTION_ID).await?;
    tokio::select! {
        _ = manager.shutdown() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("🛑 Interrupted, killing the flow");
            manager.shutdown_now().await;
        }
    }
    printer.abort();

    let graph = loader
        .get(EXECUTION_ID)
        .await
        .ok_or_else(|| anyhow!("execution {} disappeared", EXECUTION_ID))?;
    print_summary(&graph);

    if graph.status() != Status::Succeeded {
        bail!("flow {} ended with status {}", graph.flow_id, graph.status());
    }
    Ok(())
}

fn print_summary(graph: &ExecutableGraph) {
    println!();
    println!("📊 Execution Summary:");
    println!("   Status: {}", graph.status());
    if let Some(job) = graph.first_failed_job() {
        println!("   First failure: {}", job);
    }
    for (id, node) in graph.nodes() {
        if id == graph.root() {
            continue;
        }
        let took = match (node.start_time(), node.end_time()) {
            (Some(start), Some(end)) => format!(" in {}ms", (end - start).num_milliseconds()),
            _ => String::new(),
        };
        println!("   {:<30} {}{}", node.nested_id, node.status(), took);
        if let Some(message) = node.failure_message() {
            println!("      {}", message);
        }
    }
}

fn validate_flow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());

    let definition = load_definition(&file)?;
    let graph = ExecutableGraph::from_definition(0, &definition)?;
    let registry = flowjobs::default_registry();

    let unknown: Vec<String> = graph
        .nodes()
        .filter_map(|(_, node)| node.job_type().map(|t| (node, t)))
        .filter(|(_, job_type)| !registry.contains(job_type))
        .map(|(node, job_type)| format!("{} ({})", node.nested_id, job_type))
        .collect();
    if !unknown.is_empty() {
        bail!("unknown job types: {}", unknown.join(", "));
    }

    println!("✅ Flow is valid:");
    println!("   Id: {}", graph.flow_id);
    println!("   Nodes: {}", graph.len() - 1);
    println!("   Start nodes: {}", graph.start_nodes(graph.root()).len());
    Ok(())
}

fn list_job_types() {
    println!("📦 Available Job Types:");
    println!();

    let registry: JobTypeRegistry = flowjobs::default_registry();
    for job_type in registry.list_job_types() {
        if let Some(metadata) = registry.get_metadata(&job_type) {
            println!("  • {} ({})", job_type, metadata.category);
            println!("    {}", metadata.description);
            for property in &metadata.properties {
                let marker = if property.required { " (required)" } else { "" };
                println!("      {}{}: {}", property.name, marker, property.description);
            }
        } else {
            println!("  • {}", job_type);
        }
    }
}

fn create_example_flow(output: PathBuf) -> Result<()> {
    let flow = FlowDefinition::new("example")
        .with_node(NodeDefinition::job("prepare", "command").with_prop(
            "command",
            "echo '{\"rows\": \"42\"}' > \"$JOB_OUTPUT_PROP_FILE\"",
        ))
        .with_node(
            NodeDefinition::job("report", "echo")
                .depends_on("prepare")
                .with_prop("message", "report ready")
                .with_condition("${prepare:rows} != '0'"),
        )
        .with_node(
            NodeDefinition::job("cleanup", "command")
                .depends_on("prepare")
                .with_prop("command", "echo cleaning up")
                .with_retry(2, 1000),
        );

    let json = serde_json::to_string_pretty(&flow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flowexec run --file {} --param env=dev", output.display());

    Ok(())
}
