//! Cluster node records and their lifecycle

use crate::config::{ClusterConfig, Resources};
use anyhow::Result;
use std::fmt;

pub const SERVER_NAME: &str = "rke2-master";
pub const AGENT_PREFIX: &str = "rke2-worker";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Server,
    Agent,
}

impl NodeRole {
    /// systemd unit installed by the RKE2 script for this role
    pub fn service_unit(&self) -> &'static str {
        match self {
            NodeRole::Server => "rke2-server.service",
            NodeRole::Agent => "rke2-agent.service",
        }
    }

    /// Value for `INSTALL_RKE2_TYPE`; the server is the installer's default
    pub fn install_type(&self) -> Option<&'static str> {
        match self {
            NodeRole::Server => None,
            NodeRole::Agent => Some("agent"),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Server => write!(f, "control-plane"),
            NodeRole::Agent => write!(f, "worker"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub role: NodeRole,
    pub resources: Resources,
}

/// Where a node is in the bring-up sequence. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Pending,
    Created,
    BootWait,
    Provisioning,
    ServiceActivating,
    Active,
    TimedOutButContinuing,
}

impl NodeState {
    fn can_advance_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Pending, Created)
                | (Created, BootWait)
                | (BootWait, Provisioning)
                | (Provisioning, ServiceActivating)
                | (ServiceActivating, Active)
                | (ServiceActivating, TimedOutButContinuing)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Active | NodeState::TimedOutButContinuing)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeState::Pending => "pending",
            NodeState::Created => "created",
            NodeState::BootWait => "waiting for first boot",
            NodeState::Provisioning => "provisioning",
            NodeState::ServiceActivating => "waiting for service",
            NodeState::Active => "active",
            NodeState::TimedOutButContinuing => "timed out",
        };
        write!(f, "{}", label)
    }
}

/// A node as tracked by the running pipeline
#[derive(Clone, Debug)]
pub struct Node {
    pub spec: NodeSpec,
    state: NodeState,
    pub ip: Option<String>,
}

impl Node {
    pub fn new(spec: NodeSpec) -> Self {
        Self {
            spec,
            state: NodeState::Pending,
            ip: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn advance(&mut self, next: NodeState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            anyhow::bail!(
                "Node {} cannot move from '{}' to '{}'",
                self.spec.name,
                self.state,
                next
            );
        }
        tracing::debug!(node = %self.spec.name, from = %self.state, to = %next, "node state");
        self.state = next;
        Ok(())
    }
}

pub fn agent_name(index: u32) -> String {
    format!("{}{}", AGENT_PREFIX, index)
}

/// The control plane followed by every worker, in provisioning order
pub fn plan_nodes(config: &ClusterConfig) -> Vec<NodeSpec> {
    let server = NodeSpec {
        name: SERVER_NAME.to_string(),
        role: NodeRole::Server,
        resources: config.server_resources.clone(),
    };
    std::iter::once(server)
        .chain((1..=config.agents).map(|i| NodeSpec {
            name: agent_name(i),
            role: NodeRole::Agent,
            resources: config.agent_resources.clone(),
        }))
        .collect()
}
