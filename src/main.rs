//! Machine LB Controller - keeps a load balancer pool in sync with control-plane machines

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use kube::Client;
use tokio_util::sync::CancellationToken;

use machine_lb_controller::config::ControllerConfig;
use machine_lb_controller::controller::{machine_triggers, Dispatcher, Reconciler, Trigger};
use machine_lb_controller::provider::{InMemoryPool, MembershipClient};
use machine_lb_controller::retry::{retry_with_backoff, RetryConfig};
use machine_lb_controller::source::KubeMachineSource;
use machine_lb_controller::telemetry::{init_telemetry, TelemetryConfig};
use machine_lb_controller::{DEFAULT_CONTROL_PLANE_ROLE, DEFAULT_MACHINE_NAMESPACE, DEFAULT_ROLE_LABEL};

/// Machine LB Controller - registers running control-plane machines with a load balancer pool
#[derive(Parser, Debug)]
#[command(name = "machine-lb-controller", version, about, long_about = None)]
struct Cli {
    /// Load balancer pool (target group) fronting the control plane
    #[arg(long, env = "LB_POOL_ID", global = true)]
    pool_id: Option<String>,

    /// Namespace holding the Machine objects
    #[arg(long, env = "MACHINE_NAMESPACE", default_value = DEFAULT_MACHINE_NAMESPACE, global = true)]
    namespace: String,

    /// Label carrying the machine role
    #[arg(long, env = "MACHINE_ROLE_LABEL", default_value = DEFAULT_ROLE_LABEL, global = true)]
    role_label: String,

    /// Role label value marking control-plane machines
    #[arg(long, env = "CONTROL_PLANE_ROLE", default_value = DEFAULT_CONTROL_PLANE_ROLE, global = true)]
    control_plane_role: String,

    /// Seconds between full resync passes
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value = "60", global = true)]
    resync_secs: u64,

    /// Deadline in seconds for each machine or provider call
    #[arg(long, env = "CALL_TIMEOUT_SECS", default_value = "30", global = true)]
    call_timeout_secs: u64,

    /// Membership provider backing the pool
    #[arg(long, value_enum, default_value_t = ProviderKind::DryRun, global = true)]
    provider: ProviderKind,

    /// Instance ids already in the pool (dry-run provider only)
    #[arg(long = "seed-member", global = true)]
    seed_members: Vec<String>,

    /// Emit plain text logs instead of JSON
    #[arg(long, global = true)]
    log_text: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch machines and keep the pool converged (default mode)
    Run,

    /// Run a single pass, print its report as JSON and exit
    Once,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    /// Pool held in process memory; nothing leaves the controller
    DryRun,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::new(self.pool_id.clone().unwrap_or_default())
            .namespace(self.namespace.clone())
            .control_plane(self.role_label.clone(), self.control_plane_role.clone())
            .resync_interval(Duration::from_secs(self.resync_secs))
            .call_timeout(Duration::from_secs(self.call_timeout_secs))
    }

    fn membership_client(&self, pool_id: &str) -> Arc<dyn MembershipClient> {
        match self.provider {
            ProviderKind::DryRun => {
                tracing::warn!(pool = %pool_id, "using dry-run provider, pool membership is not persisted");
                Arc::new(InMemoryPool::with_members(pool_id, self.seed_members.clone()))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json: !cli.log_text,
        ..Default::default()
    })?;

    let config = cli.controller_config();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    let client = retry_with_backoff(&RetryConfig::with_max_attempts(5), "kube_client", || async {
        Client::try_default().await
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let source = Arc::new(KubeMachineSource::with_role_label(
        client.clone(),
        config.role_label.clone(),
    ));
    let membership = cli.membership_client(&config.pool_id);
    let namespace = config.namespace.clone();
    let reconciler = Arc::new(Reconciler::new(source, membership, config)?);

    match cli.command {
        Some(Commands::Once) => run_once(&reconciler).await,
        Some(Commands::Run) | None => run_controller(reconciler, client, &namespace).await,
    }
}

/// Run one pass and print what it did
async fn run_once(reconciler: &Reconciler) -> anyhow::Result<()> {
    let report = reconciler
        .reconcile(&Trigger::Resync)
        .await
        .map_err(|e| anyhow::anyhow!("reconciliation failed: {}", e))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Watch machines and reconcile until interrupted
async fn run_controller(
    reconciler: Arc<Reconciler>,
    client: Client,
    namespace: &str,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received, finishing in-flight pass");
        signal.cancel();
    });

    tracing::info!(namespace = %namespace, "starting machine watcher");
    Dispatcher::new(reconciler)
        .run(machine_triggers(client, namespace), shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("controller stopped: {}", e))
}
