use anyhow::Result;
use clap::{Parser, Subcommand};
use rke2_lab::cluster::{self, CLEANUP_HINT, Pipeline};
use rke2_lab::config::ClusterConfig;
use rke2_lab::exec::SystemRunner;
use rke2_lab::host::{self, KubectlStatus, SystemState};
use rke2_lab::kubectl::Kubectl;
use rke2_lab::multipass::{self, Multipass};
use rke2_lab::{download, kubeconfig, ui};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rke2-lab")]
#[command(about = "Bootstrap an RKE2 cluster on local Multipass VMs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the VMs, install RKE2, fetch and merge the kubeconfig
    Up {
        /// Number of worker nodes (overrides AGENTS)
        #[arg(long)]
        agents: Option<u32>,
        /// RKE2 release channel (overrides RKE2_CHANNEL)
        #[arg(long)]
        channel: Option<String>,
        /// Pinned RKE2 version, e.g. v1.30.4+rke2r1 (overrides RKE2_VERSION)
        #[arg(long)]
        rke2_version: Option<String>,
        /// Directory for the standalone kubeconfig (overrides OUTPUT_DIR)
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Switch to the new context even if another one is current
        #[arg(long)]
        set_current_context: bool,
        /// Do not merge the credentials into the user kubeconfig
        #[arg(long)]
        no_merge: bool,
    },
    /// Delete the cluster VMs (best-effort)
    Down {
        /// Also purge deleted instances from the hypervisor
        #[arg(long)]
        purge: bool,
    },
    /// Show hypervisor state and address of every cluster node
    Status,
    /// Merge an already-fetched cluster kubeconfig into the user kubeconfig
    Merge {
        /// Kubeconfig fetched from the control plane
        kubeconfig: PathBuf,
        /// Control-plane IPv4 address; names the context rke2-<ip>
        #[arg(long)]
        ip: String,
        /// Switch to the new context even if another one is current
        #[arg(long)]
        set_current_context: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config() -> Result<ClusterConfig> {
    let (config, warnings) = ClusterConfig::from_env()?;
    for warning in &warnings {
        ui::warn(warning);
    }
    Ok(config)
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let is_up = matches!(cli.command, Commands::Up { .. });

    if let Err(e) = run(cli) {
        ui::fatal(&format!("{:#}", e));
        if is_up {
            eprintln!("{}", CLEANUP_HINT);
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Up {
            agents,
            channel,
            rke2_version,
            output_dir,
            set_current_context,
            no_merge,
        } => {
            let mut config = load_config()?;
            if let Some(agents) = agents {
                config.agents = agents;
            }
            if let Some(channel) = channel {
                config.channel = channel;
            }
            if rke2_version.is_some() {
                config.version = rke2_version;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            config.set_current_context |= set_current_context;
            config.merge_kubeconfig &= !no_merge;
            up(&config)
        }
        Commands::Down { purge } => {
            let config = load_config()?;
            let runner = SystemRunner;
            let program = multipass::locate()?;
            cluster::teardown(&config, &Multipass::new(&runner, program), purge);
            Ok(())
        }
        Commands::Status => {
            let config = load_config()?;
            let runner = SystemRunner;
            let program = multipass::locate()?;
            for node in cluster::status(&config, &Multipass::new(&runner, program)) {
                println!(
                    "{:<16} {:<14} {:<10} {}",
                    node.name,
                    node.role.to_string(),
                    node.state.as_deref().unwrap_or("absent"),
                    node.ipv4.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Commands::Merge {
            kubeconfig: source,
            ip,
            set_current_context,
        } => {
            let config = load_config()?;
            let runner = SystemRunner;
            let target = Kubectl::new(&runner, &config.kubeconfig_target);
            let outcome = kubeconfig::merge_kubeconfig(
                &target,
                &source,
                &ip,
                &config.credentials_root(),
                config.set_current_context || set_current_context,
            )?;
            ui::success(&format!(
                "Context {} merged into {}{}",
                outcome.context,
                config.kubeconfig_target.display(),
                if outcome.activated { " (now current)" } else { "" }
            ));
            Ok(())
        }
    }
}

fn up(config: &ClusterConfig) -> Result<()> {
    ctrlc::set_handler(|| {
        eprintln!();
        ui::warn("Interrupted; VMs created so far are left running");
        eprintln!("{}", CLEANUP_HINT);
        std::process::exit(130);
    })?;

    let runner = SystemRunner;
    let lookup = |name: &str| which::which(name).ok();

    ui::section("Host prerequisites");
    let program = multipass::locate()?;
    ui::success(&format!("multipass found at {}", program.display()));

    match host::check_service_manager(&runner, lookup)? {
        SystemState::Running => ui::success("systemd is running"),
        SystemState::Degraded(state) => ui::warn(&format!(
            "systemd reports '{}'; VM creation may still succeed",
            state
        )),
    }

    match host::ensure_kubectl(&runner, lookup, download::fetch)? {
        KubectlStatus::AlreadyInstalled(path) => {
            ui::success(&format!("kubectl found at {}", path.display()))
        }
        KubectlStatus::Installed => ui::success("kubectl installed"),
    }

    ui::step("Downloading RKE2 install script...");
    let script = download::fetch(download::RKE2_INSTALL_SCRIPT_URL)?;

    let report = Pipeline::new(config, &runner, &program, &script).run()?;

    println!();
    ui::success(&format!(
        "Cluster ready: {} nodes, kubeconfig at {}",
        report.nodes.len(),
        report.kubeconfig.display()
    ));
    println!("  Use it with: kubectl --kubeconfig {} get nodes", report.kubeconfig.display());
    println!("  {}", CLEANUP_HINT);
    Ok(())
}
