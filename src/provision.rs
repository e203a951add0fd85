//! RKE2 installation inside a launched VM
//!
//! Both roles follow the same sequence: write `/etc/rancher/rke2/config.yaml`,
//! run the install script with the channel/version selectors, enable and start
//! the role's unit, then wait for it to report active.

use crate::exec::{CommandRunner, stdout_string};
use crate::multipass::Multipass;
use crate::node::{Node, NodeRole, NodeState};
use crate::retry::{PollOutcome, RetryPolicy};
use crate::ui;
use anyhow::{Context, Result};
use std::time::Duration;

pub const CONFIG_PATH: &str = "/etc/rancher/rke2/config.yaml";
pub const KUBECONFIG_PATH: &str = "/etc/rancher/rke2/rke2.yaml";
pub const NODE_TOKEN_PATH: &str = "/var/lib/rancher/rke2/server/node-token";
const SCRIPT_PATH: &str = "/tmp/rke2-install.sh";
const SUPERVISOR_PORT: u16 = 9345;

/// What a node needs to know to install RKE2 in its role
#[derive(Clone, Debug)]
pub enum RoleConfig<'a> {
    Server,
    Agent { server_ip: &'a str, token: &'a str },
}

impl RoleConfig<'_> {
    pub fn role(&self) -> NodeRole {
        match self {
            RoleConfig::Server => NodeRole::Server,
            RoleConfig::Agent { .. } => NodeRole::Agent,
        }
    }

    /// Body of `/etc/rancher/rke2/config.yaml`
    pub fn render(&self) -> String {
        match self {
            RoleConfig::Server => "write-kubeconfig-mode: \"0644\"\n".to_string(),
            RoleConfig::Agent { server_ip, token } => format!(
                "server: https://{}:{}\ntoken: {}\n",
                server_ip, SUPERVISOR_PORT, token
            ),
        }
    }
}

/// Release selectors for the install script
#[derive(Clone, Debug)]
pub struct InstallOptions<'a> {
    pub channel: &'a str,
    pub version: Option<&'a str>,
    pub script: &'a [u8],
}

impl InstallOptions<'_> {
    /// `env` assignments for the installer, role override last
    pub fn env_assignments(&self, role: NodeRole) -> Vec<String> {
        let mut vars = vec![format!("INSTALL_RKE2_CHANNEL={}", self.channel)];
        if let Some(version) = self.version {
            vars.push(format!("INSTALL_RKE2_VERSION={}", version));
        }
        if let Some(kind) = role.install_type() {
            vars.push(format!("INSTALL_RKE2_TYPE={}", kind));
        }
        vars
    }
}

pub struct Provisioner<'m, 'r, R: CommandRunner> {
    multipass: &'m Multipass<'r, R>,
    service_policy: RetryPolicy,
}

impl<'m, 'r, R: CommandRunner> Provisioner<'m, 'r, R> {
    pub fn new(multipass: &'m Multipass<'r, R>, service_policy: RetryPolicy) -> Self {
        Self {
            multipass,
            service_policy,
        }
    }

    /// Install RKE2 on `node` and wait for its unit, advancing the node to
    /// `Active` or `TimedOutButContinuing`
    pub fn provision(&self, node: &mut Node, role: &RoleConfig, install: &InstallOptions) -> Result<()> {
        self.provision_with_sleep(node, role, install, std::thread::sleep)
    }

    pub fn provision_with_sleep<S>(
        &self,
        node: &mut Node,
        role: &RoleConfig,
        install: &InstallOptions,
        sleep: S,
    ) -> Result<()>
    where
        S: FnMut(Duration),
    {
        node.advance(NodeState::Provisioning)?;
        let name = node.name().to_string();
        let unit = role.role().service_unit();

        ui::step(&format!("Writing {} on {}", CONFIG_PATH, name));
        self.multipass
            .write_file(&name, CONFIG_PATH, role.render().as_bytes())?;

        ui::step(&format!(
            "Installing RKE2 ({}) from channel '{}'{}",
            role.role(),
            install.channel,
            install
                .version
                .map(|v| format!(" at {}", v))
                .unwrap_or_default()
        ));
        self.multipass.write_file(&name, SCRIPT_PATH, install.script)?;

        let assignments = install.env_assignments(role.role());
        let mut argv = vec!["sudo", "env"];
        argv.extend(assignments.iter().map(String::as_str));
        argv.extend(["sh", SCRIPT_PATH]);
        self.multipass
            .exec_checked(&name, &argv)
            .context("RKE2 install script failed")?;

        self.multipass
            .exec_checked(&name, &["sudo", "systemctl", "enable", unit])?;
        self.multipass
            .exec_checked(&name, &["sudo", "systemctl", "start", unit])?;

        node.advance(NodeState::ServiceActivating)?;
        ui::step(&format!("Waiting for {} on {}...", unit, name));
        let outcome = self.service_policy.poll_with_sleep(
            "service activation",
            || {
                let output = self.multipass.exec(&name, &["systemctl", "is-active", unit])?;
                Ok(stdout_string(&output.stdout) == "active")
            },
            sleep,
        );

        match outcome {
            PollOutcome::Ready { .. } => {
                node.advance(NodeState::Active)?;
                ui::success(&format!("{} is active on {}", unit, name));
            }
            PollOutcome::Exhausted { attempts } => {
                node.advance(NodeState::TimedOutButContinuing)?;
                ui::warn(&format!(
                    "{} on {} did not become active after {} checks; continuing",
                    unit, name, attempts
                ));
            }
        }
        Ok(())
    }

    /// Read the join token from the control-plane node
    pub fn join_token(&self, server: &str) -> Result<String> {
        let token = self
            .multipass
            .read_file(server, NODE_TOKEN_PATH)
            .context("Failed to read RKE2 join token")?
            .trim()
            .to_string();
        if token.is_empty() {
            anyhow::bail!("Join token on {} is empty", server);
        }
        Ok(token)
    }
}
