use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use colonies_lite::cluster::MemoryCoordinator;
use colonies_lite::config::{NodeConfig, SchedulerConfig};
use colonies_lite::controller::Controller;
use colonies_lite::model::WorkflowSpec;
use colonies_lite::node::Node;
use colonies_lite::shutdown::install_shutdown_handler;
use colonies_lite::store::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "colonies-lite")]
#[command(version)]
#[command(about = "A multi-tenant workflow orchestrator core")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start one or more orchestrator replicas sharing an in-memory store
    Server(ServerArgs),

    /// Check a workflow file for structural defects
    Validate {
        /// Path to the workflow JSON file
        path: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node name (replicas get a numeric suffix)
    #[arg(long, default_value = "node")]
    node_name: String,

    /// Number of replicas contending for the leadership lease
    #[arg(long, default_value = "1")]
    replicas: usize,

    /// Leadership lease TTL in milliseconds
    #[arg(long, default_value = "5000")]
    lease_ttl_ms: u64,

    /// Lease renewal interval in milliseconds
    #[arg(long, default_value = "1000")]
    lease_renew_ms: u64,

    /// Generator trigger period in milliseconds
    #[arg(long, default_value = "1000")]
    generator_period_ms: u64,

    /// Cron trigger period in milliseconds
    #[arg(long, default_value = "1000")]
    cron_period_ms: u64,

    /// Deadline sweep period in milliseconds
    #[arg(long, default_value = "1000")]
    release_period_ms: u64,

    /// Enable the retention worker
    #[arg(long)]
    retention: bool,

    /// Terminal processes and graphs always kept per colony
    #[arg(long, default_value = "100")]
    retention_policy: usize,

    /// Age in seconds after which terminal items may be deleted
    #[arg(long, default_value = "604800")]
    retention_period_secs: u64,

    /// Executors silent for this many milliseconds lose their processes (0 disables)
    #[arg(long, default_value = "0")]
    stale_executor_timeout_ms: u64,

    /// Treat targeted executor IDs as advisory
    #[arg(long)]
    no_exclusive_assign: bool,

    /// Workflow files submitted once a leader is elected
    #[arg(long)]
    submit: Vec<PathBuf>,
}

impl ServerArgs {
    fn scheduler_config(&self) -> SchedulerConfig {
        let mut scheduler = SchedulerConfig {
            generator_period_ms: self.generator_period_ms,
            cron_period_ms: self.cron_period_ms,
            release_period_ms: self.release_period_ms,
            exclusive_assign: !self.no_exclusive_assign,
            stale_executor_timeout_ms: self.stale_executor_timeout_ms,
            ..SchedulerConfig::default()
        };
        if self.retention {
            scheduler = scheduler.with_retention(self.retention_policy, self.retention_period_secs);
        }
        scheduler
    }

    fn node_config(&self, replica: usize) -> NodeConfig {
        let name = if self.replicas <= 1 {
            self.node_name.clone()
        } else {
            format!("{}-{}", self.node_name, replica + 1)
        };
        NodeConfig::new(name)
            .with_lease(self.lease_ttl_ms, self.lease_renew_ms)
            .with_scheduler(self.scheduler_config())
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ValidateOutput {
    colony_name: String,
    valid: bool,
    function_specs: usize,
    roots: Vec<String>,
    error: Option<String>,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let workflows = args
        .submit
        .iter()
        .map(|path| WorkflowSpec::from_file(path))
        .collect::<Result<Vec<_>, _>>()?;

    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());
    let shutdown = install_shutdown_handler();

    let mut nodes = JoinSet::new();
    let mut controllers = Vec::new();
    for replica in 0..args.replicas.max(1) {
        let config = args.node_config(replica);
        tracing::info!(
            node = %config.node_name,
            lease = %config.lease_name,
            lease_ttl_ms = config.lease_ttl_ms,
            retention = config.scheduler.retention,
            "Starting colonies-lite node"
        );
        let node = Node::new(config, store.clone(), coordinator.clone())?;
        controllers.push(node.controller());
        nodes.spawn(node.run(shutdown.clone()));
    }

    if !workflows.is_empty() {
        tokio::spawn(submit_when_leader(controllers, workflows));
    }

    while let Some(joined) = nodes.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Node task failed");
        }
    }
    Ok(())
}

async fn submit_when_leader(controllers: Vec<Controller>, workflows: Vec<WorkflowSpec>) {
    let leader = loop {
        let mut found = None;
        for controller in &controllers {
            if controller.is_leader().await {
                found = Some(controller.clone());
                break;
            }
        }
        match found {
            Some(controller) => break controller,
            None => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    };

    for workflow in workflows {
        match leader.submit_workflow_spec(workflow).await {
            Ok(graph) => tracing::info!(graph_id = %graph.id, colony = %graph.colony_name, "Workflow submitted"),
            Err(e) => tracing::warn!(error = %e, "Workflow submission failed"),
        }
    }
}

// =============================================================================
// Validate Command
// =============================================================================

fn handle_validate(path: PathBuf, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let workflow = WorkflowSpec::from_file(&path)?;
    let result = workflow.validate();
    let output = ValidateOutput {
        colony_name: workflow.colony_name.clone(),
        valid: result.is_ok(),
        function_specs: workflow.function_specs.len(),
        roots: workflow.roots().into_iter().map(String::from).collect(),
        error: result.err().map(|e| e.to_string()),
    };

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => {
            println!("{:<16} {}", "COLONY", output.colony_name);
            println!("{:<16} {}", "FUNCTIONS", output.function_specs);
            println!("{:<16} {}", "ROOTS", output.roots.join(", "));
            match &output.error {
                None => println!("{:<16} ok", "STATUS"),
                Some(e) => println!("{:<16} invalid: {}", "STATUS", e),
            }
        }
    }

    if output.valid {
        Ok(())
    } else {
        Err("workflow is invalid".into())
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Validate { path, output } => {
            handle_validate(path, &output)?;
        }
    }

    Ok(())
}
