//! Bootstrap a single-control-plane RKE2 cluster on local Multipass VMs.

pub mod cluster;
pub mod config;
pub mod download;
pub mod exec;
pub mod host;
pub mod kubeconfig;
pub mod kubectl;
pub mod multipass;
pub mod node;
pub mod provision;
pub mod retry;
pub mod ui;
