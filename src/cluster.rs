//! End-to-end cluster bring-up, status and teardown
//!
//! Bring-up is strictly sequential: control plane first, then each worker in
//! index order, then credentials and a final node listing.

use crate::config::ClusterConfig;
use crate::exec::CommandRunner;
use crate::kubeconfig::{self, MergeOutcome};
use crate::kubectl::{Kubectl, count_ready_nodes};
use crate::multipass::Multipass;
use crate::node::{Node, NodeRole, NodeState, plan_nodes};
use crate::provision::{InstallOptions, Provisioner, RoleConfig};
use crate::retry::{BOOT_READY, PollOutcome, RetryPolicy, SERVICE_ACTIVE};
use crate::ui;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const CLEANUP_HINT: &str = "To remove the cluster VMs run: rke2-lab down --purge";

/// Outcome of a completed bring-up
#[derive(Debug)]
pub struct ClusterReport {
    pub nodes: Vec<Node>,
    pub kubeconfig: PathBuf,
    pub merged: Option<MergeOutcome>,
    pub ready_nodes: usize,
}

pub struct Pipeline<'a, R: CommandRunner> {
    config: &'a ClusterConfig,
    runner: &'a R,
    multipass: Multipass<'a, R>,
    install_script: &'a [u8],
    boot_policy: RetryPolicy,
    service_policy: RetryPolicy,
}

impl<'a, R: CommandRunner> Pipeline<'a, R> {
    pub fn new(
        config: &'a ClusterConfig,
        runner: &'a R,
        multipass_program: &Path,
        install_script: &'a [u8],
    ) -> Self {
        Self {
            config,
            runner,
            multipass: Multipass::new(runner, multipass_program),
            install_script,
            boot_policy: BOOT_READY,
            service_policy: SERVICE_ACTIVE,
        }
    }

    pub fn run(&self) -> Result<ClusterReport> {
        let mut nodes: Vec<Node> = plan_nodes(self.config).into_iter().map(Node::new).collect();
        let install = InstallOptions {
            channel: &self.config.channel,
            version: self.config.version.as_deref(),
            script: self.install_script,
        };
        let provisioner = Provisioner::new(&self.multipass, self.service_policy);

        let (server, agents) = nodes
            .split_first_mut()
            .context("Node plan has no control-plane node")?;

        ui::section(&format!("Control plane: {}", server.name()));
        self.launch_and_boot(server)?;
        provisioner.provision(server, &RoleConfig::Server, &install)?;
        let server_ip = server
            .ip
            .clone()
            .context("Control-plane node has no address")?;
        let token = provisioner.join_token(server.name())?;
        ui::success("Retrieved join token");

        for agent in agents.iter_mut() {
            ui::section(&format!("Worker: {}", agent.name()));
            self.launch_and_boot(agent)?;
            let role = RoleConfig::Agent {
                server_ip: &server_ip,
                token: &token,
            };
            provisioner.provision(agent, &role, &install)?;
        }

        ui::section("Credentials");
        let kubeconfig_path = self.config.kubeconfig_path();
        kubeconfig::fetch_kubeconfig(&self.multipass, nodes[0].name(), &server_ip, &kubeconfig_path)?;
        ui::success(&format!("Kubeconfig written to {}", kubeconfig_path.display()));

        let merged = if self.config.merge_kubeconfig {
            let target = Kubectl::new(self.runner, &self.config.kubeconfig_target);
            let outcome = kubeconfig::merge_kubeconfig(
                &target,
                &kubeconfig_path,
                &server_ip,
                &self.config.credentials_root(),
                self.config.set_current_context,
            )?;
            ui::success(&format!(
                "Context {} merged into {}{}",
                outcome.context,
                self.config.kubeconfig_target.display(),
                if outcome.activated { " (now current)" } else { "" }
            ));
            Some(outcome)
        } else {
            None
        };

        ui::section("Validation");
        let listing = Kubectl::new(self.runner, &kubeconfig_path).get_nodes()?;
        println!("{}", listing.trim_end());
        let ready_nodes = count_ready_nodes(&listing);
        let expected = nodes.len();
        if ready_nodes < expected {
            ui::warn(&format!(
                "{} of {} nodes report Ready; workers may still be joining",
                ready_nodes, expected
            ));
        } else {
            ui::success(&format!("All {} nodes are Ready", expected));
        }

        print_summary(&nodes);

        Ok(ClusterReport {
            nodes,
            kubeconfig: kubeconfig_path,
            merged,
            ready_nodes,
        })
    }

    fn launch_and_boot(&self, node: &mut Node) -> Result<()> {
        ui::step(&format!(
            "Launching {} ({} CPUs, {} memory, {} disk)...",
            node.name(),
            node.spec.resources.cpus,
            node.spec.resources.memory,
            node.spec.resources.disk
        ));
        self.multipass.launch(
            &node.spec,
            self.config.launch_timeout,
            self.config.image.as_deref(),
        )?;
        node.advance(NodeState::Created)?;

        node.advance(NodeState::BootWait)?;
        ui::step("Waiting for first boot to finish...");
        match self.multipass.await_first_boot(node.name(), &self.boot_policy) {
            PollOutcome::Ready { .. } => ui::success(&format!("{} finished first boot", node.name())),
            PollOutcome::Exhausted { attempts } => ui::warn(&format!(
                "{} did not report first boot done after {} checks; continuing",
                node.name(),
                attempts
            )),
        }

        // Only the control plane's address is consumed downstream
        match self.multipass.resolve_address(node.name()) {
            Ok(ip) => {
                ui::success(&format!("{} has address {}", node.name(), ip));
                node.ip = Some(ip);
            }
            Err(e) if node.spec.role == NodeRole::Agent => {
                ui::warn(&format!("{:#}; provisioning anyway", e));
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

fn print_summary(nodes: &[Node]) {
    ui::section("Nodes");
    for node in nodes {
        println!(
            "  {:<16} {:<14} {:<16} {}",
            node.name(),
            node.spec.role.to_string(),
            node.ip.as_deref().unwrap_or("-"),
            node.state()
        );
    }
}

/// Delete every planned node, best-effort, optionally purging afterwards
pub fn teardown<R: CommandRunner>(config: &ClusterConfig, multipass: &Multipass<R>, purge: bool) {
    for spec in plan_nodes(config).iter().rev() {
        ui::step(&format!("Deleting {}...", spec.name));
        multipass.destroy(&spec.name);
    }
    if purge {
        ui::step("Purging deleted instances...");
        multipass.purge_all();
    }
    ui::success("Teardown finished");
}

/// Hypervisor view of one planned node; `state` is `None` when it does not exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub name: String,
    pub role: NodeRole,
    pub state: Option<String>,
    pub ipv4: Option<String>,
}

pub fn status<R: CommandRunner>(config: &ClusterConfig, multipass: &Multipass<R>) -> Vec<NodeStatus> {
    plan_nodes(config)
        .into_iter()
        .map(|spec| {
            let info = multipass.info(&spec.name).unwrap_or_default();
            NodeStatus {
                name: spec.name,
                role: spec.role,
                state: info.state,
                ipv4: info.ipv4,
            }
        })
        .collect()
}
