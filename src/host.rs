//! Host prerequisites: service manager health and the local kubectl

use crate::exec::{CommandRunner, stdout_string};
use crate::ui;
use anyhow::{Context, Result};
use std::path::PathBuf;

const KUBERNETES_APT_REPO: &str = "https://pkgs.k8s.io/core:/stable:/v1.31/deb/";
const KUBERNETES_KEYRING: &str = "/etc/apt/keyrings/kubernetes-apt-keyring.gpg";
const KUBERNETES_SOURCE_LIST: &str = "/etc/apt/sources.list.d/kubernetes.list";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemState {
    Running,
    /// Anything but `running` from `systemctl is-system-running`
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubectlStatus {
    AlreadyInstalled(PathBuf),
    Installed,
}

/// Fail if systemctl is missing; report (but tolerate) a degraded system state
pub fn check_service_manager<R, F>(runner: &R, lookup: F) -> Result<SystemState>
where
    R: CommandRunner,
    F: Fn(&str) -> Option<PathBuf>,
{
    if lookup("systemctl").is_none() {
        anyhow::bail!(
            "systemctl not found. A systemd-based host is required to run multipass."
        );
    }

    // Exits non-zero for every state except `running`, so only stdout matters
    let output = runner
        .run("systemctl", &["is-system-running"])
        .context("Failed to query systemd state")?;
    let state = stdout_string(&output.stdout);

    if state == "running" {
        Ok(SystemState::Running)
    } else {
        Ok(SystemState::Degraded(if state.is_empty() {
            "unknown".to_string()
        } else {
            state
        }))
    }
}

/// Install kubectl from the Kubernetes apt repository unless it is already on `PATH`
pub fn ensure_kubectl<R, F, D>(runner: &R, lookup: F, fetch: D) -> Result<KubectlStatus>
where
    R: CommandRunner,
    F: Fn(&str) -> Option<PathBuf>,
    D: Fn(&str) -> Result<Vec<u8>>,
{
    if let Some(path) = lookup("kubectl") {
        return Ok(KubectlStatus::AlreadyInstalled(path));
    }
    if lookup("apt-get").is_none() {
        anyhow::bail!(
            "kubectl not found and apt-get is unavailable.\n\
             Install kubectl manually: https://kubernetes.io/docs/tasks/tools/"
        );
    }

    ui::step("kubectl not found, installing from the Kubernetes apt repository...");

    runner.run_checked("sudo", &["apt-get", "update"])?;
    runner.run_checked(
        "sudo",
        &[
            "apt-get",
            "install",
            "-y",
            "apt-transport-https",
            "ca-certificates",
            "gnupg",
        ],
    )?;
    runner.run_checked("sudo", &["mkdir", "-p", "-m", "755", "/etc/apt/keyrings"])?;

    let key_url = format!("{}Release.key", KUBERNETES_APT_REPO);
    let key = fetch(&key_url).context("Failed to download Kubernetes apt signing key")?;
    runner
        .run_with_stdin_checked(
            "sudo",
            &["gpg", "--batch", "--yes", "--dearmor", "-o", KUBERNETES_KEYRING],
            &key,
        )
        .context("Failed to install Kubernetes apt signing key")?;

    let source = format!("deb [signed-by={}] {} /\n", KUBERNETES_KEYRING, KUBERNETES_APT_REPO);
    runner
        .run_with_stdin_checked("sudo", &["tee", KUBERNETES_SOURCE_LIST], source.as_bytes())
        .context("Failed to register Kubernetes apt repository")?;

    runner.run_checked("sudo", &["apt-get", "update"])?;
    runner
        .run_checked("sudo", &["apt-get", "install", "-y", "kubectl"])
        .context("Failed to install kubectl")?;

    Ok(KubectlStatus::Installed)
}
