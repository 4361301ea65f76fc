use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use latticecore::{
    DataKind, ExecutionEvent, LoopMode, NodeEvent, NodeId, NodeSpec, SubGraph, Workflow,
};
use latticeruntime::{
    Bundle, ComponentRegistry, FlowRuntime, RunInputs, RunReport, RunStatus, RuntimeConfig,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lattice")]
#[command(about = "Lattice workflow engine CLI", long_about = None)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct EngineArgs {
    /// Directory of *.component.json manifests (repeatable)
    #[arg(short, long)]
    components: Vec<PathBuf>,

    /// Maximum number of nodes running at once
    #[arg(long, default_value_t = 10)]
    parallel: usize,

    /// Default per-node timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Interpreter for script nodes and dependency repair
    #[arg(long, default_value = "python3")]
    interpreter: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Inputs document (environment, custom, nodes)
        #[arg(short, long)]
        inputs: Option<PathBuf>,

        /// Write the results document here
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// List available component types
    Nodes {
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },

    /// Export selected nodes into a standalone bundle
    Export {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Comma-separated node ids
        #[arg(short, long, value_delimiter = ',', required = true)]
        nodes: Vec<NodeId>,

        /// Bundle directory
        #[arg(long)]
        out: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Execute an exported bundle
    RunBundle {
        /// Bundle directory
        dir: PathBuf,

        /// Inputs document; `interface` values are bound by name
        #[arg(short, long)]
        inputs: Option<PathBuf>,

        /// Write the results document here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Install the bundle's requirements before running
        #[arg(long)]
        install_deps: bool,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Run {
            file,
            inputs,
            output,
            engine,
        } => {
            let workflow = load_workflow(&file)?;
            let inputs = load_inputs(inputs.as_deref())?;
            anyhow::ensure!(
                inputs.interface.is_empty(),
                "interface values are only accepted by run-bundle"
            );
            let runtime = build_runtime(&engine, &[])?;
            let report = run_workflow(&runtime, workflow, inputs).await?;
            finish(&report, output.as_deref())?;
        }

        Commands::Validate { file, engine } => {
            validate_workflow(&file, &engine)?;
        }

        Commands::Nodes { engine } => {
            list_nodes(&engine)?;
        }

        Commands::Init { output } => {
            create_example_workflow(&output)?;
        }

        Commands::Export {
            file,
            nodes,
            out,
            engine,
        } => {
            let workflow = load_workflow(&file)?;
            let runtime = build_runtime(&engine, &[])?;
            let selected: HashSet<NodeId> = nodes.into_iter().collect();
            let spec = latticeruntime::export(&workflow, &selected, runtime.registry(), &out)?;
            println!("📦 Exported {} nodes to {}", selected.len(), out.display());
            for port in &spec.inputs {
                println!("   ⬅️  {} ({})", port.name, port.kind);
            }
            for port in &spec.outputs {
                println!("   ➡️  {} ({})", port.name, port.kind);
            }
        }

        Commands::RunBundle {
            dir,
            inputs,
            output,
            install_deps,
            engine,
        } => {
            let bundle = Bundle::load(&dir)
                .with_context(|| format!("Failed to load bundle {}", dir.display()))?;
            let components = bundle.components_dir();
            let extra: Vec<PathBuf> = if components.is_dir() {
                vec![components]
            } else {
                Vec::new()
            };
            let runtime = build_runtime(&engine, &extra)?;

            if install_deps {
                let requirements = bundle.requirements();
                let log = runtime
                    .event_bus()
                    .create_emitter(NodeId::nil(), NodeId::nil());
                let report = runtime.resolver().ensure(&requirements, &log).await?;
                println!(
                    "📥 Requirements: {} installed, {} already satisfied",
                    report.installed.len(),
                    report.satisfied.len()
                );
            }

            let inputs = load_inputs(inputs.as_deref())?.bind_interface(&bundle.interface)?;
            let report = run_workflow(&runtime, bundle.workflow, inputs).await?;
            finish(&report, output.as_deref())?;
        }
    }

    Ok(())
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let workflow_json = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let workflow: Workflow = serde_json::from_str(&workflow_json)
        .with_context(|| format!("Invalid workflow document {}", file.display()))?;
    Ok(workflow)
}

fn load_inputs(file: Option<&Path>) -> Result<RunInputs> {
    match file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(serde_json::from_str(&text)
                .with_context(|| format!("Invalid inputs document {}", path.display()))?)
        }
        None => Ok(RunInputs::default()),
    }
}

fn build_runtime(engine: &EngineArgs, extra_dirs: &[PathBuf]) -> Result<FlowRuntime> {
    let registry = Arc::new(ComponentRegistry::new());
    latticenodes::register_with_interpreter(&registry, &engine.interpreter);

    let config = RuntimeConfig {
        max_parallel_nodes: engine.parallel,
        default_timeout: engine.timeout_ms.map(Duration::from_millis),
        interpreter: engine.interpreter.clone(),
        component_dirs: engine.components.iter().chain(extra_dirs).cloned().collect(),
        ..RuntimeConfig::default()
    };
    let runtime = FlowRuntime::with_registry(registry, config);
    let loaded = runtime.load_components()?;
    if loaded > 0 {
        tracing::info!("Loaded {} process components", loaded);
    }
    Ok(runtime)
}

async fn run_workflow(runtime: &FlowRuntime, workflow: Workflow, inputs: RunInputs) -> Result<RunReport> {
    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!();

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::WorkflowStarted { .. } => {
                    println!("▶️  Workflow started");
                }
                ExecutionEvent::NodeStatusChanged { .. } => {}
                ExecutionEvent::NodeCompleted {
                    node_id,
                    duration_ms,
                    ..
                } => {
                    println!("  ✅ Node {} completed in {}ms", node_id, duration_ms);
                }
                ExecutionEvent::NodeFailed { node_id, error, .. } => {
                    println!("  ❌ Node {} failed: {}", node_id, error);
                }
                ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
                    NodeEvent::Info { message } => {
                        println!("     ℹ️  [{}] {}", node_id, message);
                    }
                    NodeEvent::Warning { message } => {
                        println!("     ⚠️  [{}] {}", node_id, message);
                    }
                    NodeEvent::Progress { percent, message } => match message {
                        Some(msg) => println!("     📊 [{}] {}% - {}", node_id, percent, msg),
                        None => println!("     📊 [{}] {}%", node_id, percent),
                    },
                },
                ExecutionEvent::WorkflowCompleted {
                    success,
                    duration_ms,
                    ..
                } => {
                    if success {
                        println!("✨ Workflow completed successfully in {}ms", duration_ms);
                    } else {
                        println!("💥 Workflow did not succeed after {}ms", duration_ms);
                    }
                }
            }
        }
    });

    let handle = runtime.spawn(workflow, inputs)?;
    let cancel = handle.cancellation();
    let wait = handle.wait();
    tokio::pin!(wait);
    let report = tokio::select! {
        report = &mut wait => report?,
        _ = tokio::signal::ctrl_c() => {
            println!("🛑 Interrupted, cancelling run");
            cancel.cancel();
            wait.await?
        }
    };

    // Wait for events to finish printing
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();
    Ok(report)
}

fn finish(report: &RunReport, output: Option<&Path>) -> Result<()> {
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", report.execution_id);
    println!("   Status: {:?}", report.status);
    println!("   Duration: {}ms", report.duration_ms);
    for node in &report.nodes {
        let label = node.name.clone().unwrap_or_else(|| node.node_id.to_string());
        println!("   {} {}", node.status, label);
        if let Some(result) = &node.result {
            for (key, value) in &result.outputs {
                println!("     {}: {}", key, value.to_json());
            }
        }
        if let Some(error) = &node.error {
            println!("     error ({}): {}", error.kind, error.message);
        }
    }

    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(report)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!();
        println!("💾 Results written to {}", path.display());
    }

    match report.status {
        RunStatus::Success => Ok(()),
        RunStatus::Failed => anyhow::bail!("workflow failed"),
        RunStatus::Cancelled => anyhow::bail!("workflow cancelled"),
    }
}

fn validate_workflow(file: &Path, engine: &EngineArgs) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(file)?;
    let runtime = build_runtime(engine, &[])?;
    runtime.validate(&workflow)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    Ok(())
}

fn list_nodes(engine: &EngineArgs) -> Result<()> {
    println!("📦 Available Component Types:");
    println!();

    let runtime = build_runtime(engine, &[])?;
    let registry = runtime.registry();
    for component_type in registry.list_types() {
        if let Some(metadata) = registry.metadata(&component_type) {
            println!("  • {} ({})", component_type, metadata.category);
            println!("    {}", metadata.description);
            if !metadata.requirements.is_empty() {
                println!("    requires: {}", metadata.requirements);
            }
        } else {
            println!("  • {}", component_type);
        }
    }
    Ok(())
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = Workflow::new("Example Branch Workflow");
    workflow.description = Some("Routes a number to one of two loggers, then counts to three".to_string());

    let input_id = workflow.add_node(
        NodeSpec::new("input.value")
            .with_name("Amount")
            .with_property("value", 42.0)
            .with_output("value", DataKind::Number)
            .with_position(100.0, 100.0),
    );
    let branch_id = workflow.add_node(
        NodeSpec::branch([("large", "value > 10")])
            .with_name("Route")
            .with_position(300.0, 100.0),
    );
    let large_id = workflow.add_node(
        NodeSpec::new("debug.log")
            .with_name("Large")
            .with_property("message", "large amount: $input.value$")
            .with_input("value", DataKind::Any)
            .with_position(500.0, 50.0),
    );
    let small_id = workflow.add_node(
        NodeSpec::new("debug.log")
            .with_name("Small")
            .with_property("message", "small amount: $input.value$")
            .with_input("value", DataKind::Any)
            .with_position(500.0, 150.0),
    );

    let mut body = SubGraph::new();
    let step = body.add_node(
        NodeSpec::new("debug.log")
            .with_name("Step")
            .with_property("message", "pass $index$")
            .with_input("value", DataKind::Any)
            .with_output("value", DataKind::Any),
    );
    let body = body.with_entry(step, "value").with_exit(step, "value");
    let loop_id = workflow.add_node(
        NodeSpec::bounded_loop(LoopMode::Count { times: 3 }, 10, body)
            .with_name("Count")
            .with_position(700.0, 100.0),
    );

    workflow.connect(input_id, "value", branch_id, "input");
    workflow.connect(branch_id, "large", large_id, "value");
    workflow.connect(branch_id, "else", small_id, "value");
    workflow.connect(input_id, "value", loop_id, "input");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  lattice run --file {}", output.display());
    Ok(())
}
